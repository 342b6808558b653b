use crate::auth;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Discriminator carried by device error responses
pub const MSG_ERROR: &str = "Error";
/// Discriminator confirming a successful login
pub const MSG_AUTHENTICATED: &str = "Authenticated";
/// Substring of an error's `Text` that signals a login challenge
pub const UNAUTHORIZED_TEXT: &str = "Unauthorized";

/// Message metadata. `Hash` is an opaque correlation token assigned by the
/// producer; devices echo it back on responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(rename = "Hash", skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One JMP message.
///
/// The engine interprets only the reserved fields below; everything else is
/// opaque payload carried in `fields` and passed through to listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JmpMessage {
    #[serde(rename = "Message", default)]
    pub message: String,

    #[serde(rename = "Meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,

    /// Present only on outbound login messages
    #[serde(rename = "Auth-Digest", skip_serializing_if = "Option::is_none")]
    pub auth_digest: Option<String>,

    /// Server-issued challenge value, present on unauthorized errors
    #[serde(rename = "Nonce", skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    #[serde(rename = "Text", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl JmpMessage {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            meta: Some(Meta {
                hash: Some(auth::generate_hash()),
                extra: Map::new(),
            }),
            auth_digest: None,
            nonce: None,
            text: None,
            fields: Map::new(),
        }
    }

    /// The empty message sent right after connecting. It provokes either an
    /// unauthorized error carrying a nonce, or a welcome message when the
    /// device requires no login.
    pub fn probe() -> Self {
        Self::new("")
    }

    /// Builds the login response to an unauthorized challenge.
    pub fn login(username: &str, password: &str, nonce: &str) -> Self {
        let mut msg = Self::new("");
        msg.auth_digest = Some(auth::compute_auth_digest(username, password, nonce));
        msg
    }

    /// An output-relay control command.
    pub fn control(command: &str, channel: u32) -> Self {
        let mut msg = Self::new("Control");
        msg.set_field("Command", Value::from(command));
        msg.set_field("Channel", Value::from(channel));
        msg
    }

    /// Closes an output relay, optionally only for `duration` milliseconds.
    pub fn control_close(channel: u32, duration: Option<u64>) -> Self {
        let mut msg = Self::control("Close", channel);
        if let Some(millis) = duration {
            msg.set_field("Duration", Value::from(millis));
        }
        msg
    }

    /// Opens an output relay.
    pub fn control_open(channel: u32) -> Self {
        Self::control("Open", channel)
    }

    /// Lists the contents of a folder on the device filesystem.
    pub fn file_list(folder: &str) -> Self {
        let mut msg = Self::new("File List");
        msg.set_field("Folder", Value::from(folder));
        msg
    }

    /// Reads a slice of a file from the device filesystem.
    pub fn file_read(filename: &str, offset: Option<u64>, limit: Option<u64>) -> Self {
        let file = if filename.starts_with('/') {
            filename.to_string()
        } else {
            format!("/{}", filename)
        };

        let mut msg = Self::new("File Read");
        msg.set_field("File", Value::from(file));
        msg.set_field("Limit", Value::from(limit.unwrap_or(16 * 1024)));
        if let Some(offset) = offset {
            msg.set_field("Offset", Value::from(offset));
        }
        msg
    }

    /// Reads a set of registry keys.
    pub fn registry_read(keys: &[&str]) -> Self {
        let mut msg = Self::new("Registry Read");
        msg.set_field(
            "Keys",
            Value::from(keys.iter().map(|k| Value::from(*k)).collect::<Vec<_>>()),
        );
        msg
    }

    /// Posts a message to an application running on the device. The content
    /// travels as a JSON string, matching what device applications expect.
    pub fn post_message(number: u32, content: &Value) -> Self {
        let mut msg = Self::new("Post Message");
        msg.set_field("Number", Value::from(number));
        msg.set_field("Content", Value::from(content.to_string()));
        msg
    }

    /// The discriminator string routing control vs application messages.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    pub fn auth_digest(&self) -> Option<&str> {
        self.auth_digest.as_deref()
    }

    pub fn meta_hash(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|meta| meta.hash.as_deref())
    }

    /// Looks up a non-reserved field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }
}
