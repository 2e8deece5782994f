//! Typed gateway actions and their type-erased routes.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::connection::Connection;
use crate::auth::session::Validated;
use crate::error::{FieldError, GatewayError};
use crate::AppState;

/// Who may call an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// No session required.
    Public,
    /// A currently valid session must be bound to the connection.
    Authenticated,
}

/// Field-level checks beyond what deserialization enforces.
pub trait Validate {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        Ok(())
    }
}

/// Collects field errors while validating a payload.
#[derive(Debug, Default)]
pub struct Violations(Vec<FieldError>);

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `message` against `field` unless `ok`.
    pub fn check(&mut self, ok: bool, field: &str, message: &str) -> &mut Self {
        if !ok {
            self.0.push(FieldError::new(field, message));
        }
        self
    }

    pub fn required(&mut self, value: &str, field: &str) -> &mut Self {
        self.check(!value.trim().is_empty(), field, "is required")
    }

    pub fn finish(&mut self) -> Result<(), Vec<FieldError>> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(std::mem::take(&mut self.0))
        }
    }
}

/// Payload of actions that take no arguments. Accepts `{}` or no payload.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoPayload {}

impl Validate for NoPayload {}

/// Everything a handler sees about the request it is serving.
pub struct RequestContext {
    pub state: AppState,
    pub connection: Arc<Connection>,
    pub request_id: String,
    identity: Option<Validated>,
}

impl RequestContext {
    pub fn new(
        state: AppState,
        connection: Arc<Connection>,
        request_id: String,
        identity: Option<Validated>,
    ) -> Self {
        Self {
            state,
            connection,
            request_id,
            identity,
        }
    }

    /// The validated session and account. Present on every
    /// [`Access::Authenticated`] action.
    pub fn identity(&self) -> Result<&Validated, GatewayError> {
        self.identity.as_ref().ok_or(GatewayError::SessionRequired)
    }

    pub fn account_id(&self) -> Result<&str, GatewayError> {
        Ok(self.identity()?.account.id.as_str())
    }
}

/// A gateway operation addressed by `category.action`.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    type Payload: DeserializeOwned + Validate + Send + 'static;

    const KEY: &'static str;
    const ACCESS: Access;

    async fn run(&self, ctx: RequestContext, payload: Self::Payload) -> Result<Value, GatewayError>;
}

/// A decoded, validated call waiting for its request context.
pub type Call = Box<dyn FnOnce(RequestContext) -> BoxFuture<'static, Result<Value, GatewayError>> + Send>;

/// Object-safe view of an [`Action`], stored in the router's table.
pub trait Route: Send + Sync {
    fn key(&self) -> &'static str;
    fn access(&self) -> Access;

    /// Decode and validate the payload. Runs before any session check.
    fn prepare(self: Arc<Self>, payload: Value) -> Result<Call, GatewayError>;
}

impl<A: Action> Route for A {
    fn key(&self) -> &'static str {
        A::KEY
    }

    fn access(&self) -> Access {
        A::ACCESS
    }

    fn prepare(self: Arc<Self>, payload: Value) -> Result<Call, GatewayError> {
        let payload: A::Payload = decode(payload)?;
        payload.validate().map_err(GatewayError::Validation)?;
        Ok(Box::new(move |ctx| {
            Box::pin(async move { self.run(ctx, payload).await })
        }))
    }
}

/// Deserialize a payload, turning serde's message into a field error.
///
/// A missing payload decodes like `{}`.
pub fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, GatewayError> {
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|e| {
        let message = e.to_string();
        let field = quoted_field(&message).unwrap_or("payload");
        GatewayError::Validation(vec![FieldError::new(field, message.clone())])
    })
}

/// serde reports missing and unknown fields as ``missing field `name` ``.
fn quoted_field(message: &str) -> Option<&str> {
    if !(message.starts_with("missing field") || message.starts_with("unknown field")) {
        return None;
    }
    let start = message.find('`')? + 1;
    let len = message[start..].find('`')?;
    Some(&message[start..start + len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Login {
        email: String,
        password: String,
    }

    impl Validate for Login {
        fn validate(&self) -> Result<(), Vec<FieldError>> {
            Violations::new()
                .check(self.email.contains('@'), "email", "must be an email address")
                .check(self.password.len() >= 8, "password", "must be at least 8 characters")
                .finish()
        }
    }

    #[test]
    fn missing_field_is_named() {
        let err = decode::<Login>(json!({ "email": "a@b.c" })).unwrap_err();
        let GatewayError::Validation(fields) = err else {
            panic!("expected validation error");
        };
        assert_eq!(fields[0].field, "password");
    }

    #[test]
    fn wrong_type_falls_back_to_payload() {
        let err = decode::<Login>(json!({ "email": 5, "password": "x" })).unwrap_err();
        let GatewayError::Validation(fields) = err else {
            panic!("expected validation error");
        };
        assert_eq!(fields[0].field, "payload");
        assert!(fields[0].message.contains("invalid type"));
    }

    #[test]
    fn null_payload_decodes_as_empty_object() {
        assert!(decode::<NoPayload>(Value::Null).is_ok());
        assert!(decode::<NoPayload>(json!({ "extra": 1 })).is_err());
    }

    #[test]
    fn violations_collect_every_failure() {
        let login = Login {
            email: "nope".into(),
            password: "short".into(),
        };
        let fields = login.validate().unwrap_err();
        let names: Vec<_> = fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(names, vec!["email", "password"]);
    }
}
