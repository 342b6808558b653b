use jmp_proto::JmpMessage;

/// Username and password for the device login.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// What the connection should do in response to an unauthorized error.
#[derive(Debug)]
pub enum HandshakeAction {
    /// Send this login message built from the challenge nonce
    SendLogin(JmpMessage),
    /// Authentication has failed for this connection lifetime
    Failed,
}

/// Tracks the login challenge/response cycle for one connection lifetime.
///
/// The device answers the first (unauthenticated) message with an error
/// carrying a nonce; we answer that with a single login attempt. A second
/// unauthorized error means the credentials were refused, and no further
/// attempt is made until the connection is reopened.
pub struct AuthHandshake {
    credentials: Option<Credentials>,
    attempted: bool,
}

impl Default for AuthHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthHandshake {
    pub fn new() -> Self {
        Self {
            credentials: None,
            attempted: false,
        }
    }

    /// Installs new credentials and allows a fresh login attempt.
    pub fn set_credentials(&mut self, username: &str, password: &str) {
        self.credentials = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        self.attempted = false;
    }

    /// Called on each new connection so the single login attempt is
    /// available again.
    pub fn reset(&mut self) {
        self.attempted = false;
    }

    pub fn attempted(&self) -> bool {
        self.attempted
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Reacts to an unauthorized error carrying `nonce`.
    pub fn on_unauthorized(&mut self, nonce: &str) -> HandshakeAction {
        match &self.credentials {
            Some(credentials) if !self.attempted => {
                self.attempted = true;
                HandshakeAction::SendLogin(JmpMessage::login(
                    &credentials.username,
                    &credentials.password,
                    nonce,
                ))
            }
            _ => HandshakeAction::Failed,
        }
    }
}
