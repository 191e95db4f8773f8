use std::sync::OnceLock;

use serde::de::{Deserializer, Error as _};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One Bayeux message: a JSON object with a handful of recognized keys.
///
/// The wire form is cached on first [`serialized`](Message::serialized) call;
/// later mutations are deliberately not reflected in it, so a message queued
/// for delivery keeps the exact bytes it was accepted with.
#[derive(Clone, Debug, Default)]
pub struct Message {
    fields: Map<String, Value>,
    wire: OnceLock<String>,
}

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh reply skeleton echoing the incoming message's `id` and
    /// `channel`.
    #[must_use]
    pub fn reply_to(message: &Message) -> Self {
        let mut reply = Self::new();
        if let Some(channel) = message.channel() {
            reply.set_channel(channel);
        }
        if let Some(id) = message.id() {
            reply.insert("id", id.clone());
        }
        reply
    }

    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(fields.into()),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let _ = self.fields.insert(key.into(), value);
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn channel(&self) -> Option<&str> {
        self.str_field("channel")
    }

    pub fn set_channel(&mut self, channel: impl Into<String>) {
        self.insert("channel", Value::String(channel.into()));
    }

    pub fn client_id(&self) -> Option<&str> {
        self.str_field("clientId")
    }

    pub fn set_client_id(&mut self, client_id: impl Into<String>) {
        self.insert("clientId", Value::String(client_id.into()));
    }

    /// The client-chosen message id, echoed verbatim in replies. Clients may
    /// send any JSON scalar here.
    pub fn id(&self) -> Option<&Value> {
        self.fields.get("id")
    }

    pub fn data(&self) -> Option<&Value> {
        self.fields.get("data")
    }

    pub fn set_data(&mut self, data: Value) {
        self.insert("data", data);
    }

    pub fn successful(&self) -> Option<bool> {
        self.fields.get("successful").and_then(Value::as_bool)
    }

    pub fn set_successful(&mut self, successful: bool) {
        self.insert("successful", Value::Bool(successful));
    }

    pub fn error(&self) -> Option<&str> {
        self.str_field("error")
    }

    /// Marks the message unsuccessful with the given `code::tag` error.
    pub fn set_error(&mut self, code: &str) {
        self.insert("error", Value::String(code.to_owned()));
        self.set_successful(false);
    }

    pub fn version(&self) -> Option<&str> {
        self.str_field("version")
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.insert("version", Value::String(version.into()));
    }

    pub fn connection_type(&self) -> Option<&str> {
        self.str_field("connectionType")
    }

    pub fn set_supported_connection_types(&mut self, types: &[&str]) {
        self.insert(
            "supportedConnectionTypes",
            Value::Array(types.iter().map(|t| Value::String((*t).to_owned())).collect()),
        );
    }

    /// The `subscription` field as a channel-name list: a string becomes a
    /// singleton, a list of strings is taken as-is. `None` when the field is
    /// absent or not of either shape.
    pub fn subscription_channels(&self) -> Option<Vec<String>> {
        match self.fields.get("subscription")? {
            Value::String(one) => Some(vec![one.clone()]),
            Value::Array(many) => many
                .iter()
                .map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => None,
        }
    }

    pub fn subscription(&self) -> Option<&Value> {
        self.fields.get("subscription")
    }

    pub fn ext(&self) -> Option<&Map<String, Value>> {
        self.fields.get("ext").and_then(Value::as_object)
    }

    pub fn ext_mut(&mut self) -> &mut Map<String, Value> {
        Self::object_mut(&mut self.fields, "ext")
    }

    pub fn advice(&self) -> Option<&Map<String, Value>> {
        self.fields.get("advice").and_then(Value::as_object)
    }

    pub fn advice_mut(&mut self) -> &mut Map<String, Value> {
        Self::object_mut(&mut self.fields, "advice")
    }

    /// The field as a mutable object, replacing any non-object value a
    /// client may have sent there.
    fn object_mut<'a>(fields: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
        let entry = fields
            .entry(key)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry.as_object_mut() {
            Some(object) => object,
            None => unreachable!("entry was just forced to an object"),
        }
    }

    /// The client-advertised advice value in milliseconds, `-1` when absent.
    pub fn advice_ms(&self, key: &str) -> i64 {
        self.advice()
            .and_then(|advice| advice.get(key))
            .and_then(Value::as_i64)
            .unwrap_or(-1)
    }

    /// The cached wire form, computed once.
    pub fn serialized(&self) -> &str {
        self.wire
            .get_or_init(|| Value::Object(self.fields.clone()).to_string())
    }

    #[must_use]
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

impl From<Map<String, Value>> for Message {
    fn from(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            wire: OnceLock::new(),
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Object(fields) => Ok(fields.into()),
            other => Err(D::Error::custom(format!(
                "expected a message object, got {other}"
            ))),
        }
    }
}
