//! SASL authentication for the AUTHENTICATE handshake.
//!
//! The server names its authenticator class in AUTHENTICATE; the client
//! answers with AUTH_RESPONSE tokens until AUTH_SUCCESS arrives.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::error::{CqlError, CqlResult};

/// Client side of one SASL exchange.
pub trait Authenticator: Send {
    /// Token sent in the first AUTH_RESPONSE.
    fn initial_response(&mut self) -> CqlResult<Option<Bytes>>;

    /// Answer an AUTH_CHALLENGE.
    fn evaluate_challenge(&mut self, token: Option<&[u8]>) -> CqlResult<Option<Bytes>>;

    /// Called with the AUTH_SUCCESS token.
    fn on_success(&mut self, _token: Option<&[u8]>) -> CqlResult<()> {
        Ok(())
    }
}

/// Creates an authenticator for the class the server announced.
pub trait AuthProvider: Send + Sync + fmt::Debug {
    fn new_authenticator(&self, class_name: &str) -> CqlResult<Box<dyn Authenticator>>;
}

// ============================================================================
// Plain Text (SASL PLAIN)
// ============================================================================

/// Username/password provider for `PasswordAuthenticator` servers.
#[derive(Clone)]
pub struct PlainTextAuthProvider {
    username: String,
    password: String,
}

impl PlainTextAuthProvider {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl fmt::Debug for PlainTextAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainTextAuthProvider")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl AuthProvider for PlainTextAuthProvider {
    fn new_authenticator(&self, _class_name: &str) -> CqlResult<Box<dyn Authenticator>> {
        Ok(Box::new(PlainTextAuthenticator {
            username: self.username.clone(),
            password: self.password.clone(),
        }))
    }
}

/// SASL PLAIN: a single `\0user\0password` token.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl Authenticator for PlainTextAuthenticator {
    fn initial_response(&mut self) -> CqlResult<Option<Bytes>> {
        let mut token = BytesMut::with_capacity(2 + self.username.len() + self.password.len());
        token.put_u8(0);
        token.put_slice(self.username.as_bytes());
        token.put_u8(0);
        token.put_slice(self.password.as_bytes());
        Ok(Some(token.freeze()))
    }

    fn evaluate_challenge(&mut self, _token: Option<&[u8]>) -> CqlResult<Option<Bytes>> {
        Err(CqlError::Auth(
            "Unexpected challenge for plain text authentication".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_token() {
        let mut auth = PlainTextAuthenticator::new("cassandra", "secret");
        let token = auth.initial_response().unwrap().unwrap();
        assert_eq!(&token[..], b"\0cassandra\0secret");
    }

    #[test]
    fn test_plain_text_rejects_challenge() {
        let provider = PlainTextAuthProvider::new("u", "p");
        let mut auth = provider
            .new_authenticator("org.apache.cassandra.auth.PasswordAuthenticator")
            .unwrap();

        assert!(auth.initial_response().unwrap().is_some());
        assert!(matches!(
            auth.evaluate_challenge(Some(b"more?")),
            Err(CqlError::Auth(_))
        ));
        assert!(auth.on_success(None).is_ok());
    }

    #[test]
    fn test_provider_debug_hides_password() {
        let provider = PlainTextAuthProvider::new("admin", "hunter2");
        let shown = format!("{:?}", provider);
        assert!(shown.contains("admin"));
        assert!(!shown.contains("hunter2"));
    }
}
