//! Outbound message delivery.
//!
//! A single delivery is one HTTP POST of the provisioned message to the
//! fixed remote endpoint, wrapped in a small JSON envelope. Success and
//! failure are binary; retry policy belongs to the caller.

use std::fmt;

use serde::Serialize;

/// Fixed destination for delivered messages.
pub const DELIVERY_URL: &str =
    "https://europe-west3-einstiegsaufgabe.cloudfunctions.net/receive_data";

/// Content type sent with every delivery.
pub const DELIVERY_CONTENT_TYPE: &str = "application/json";

/// JSON envelope the endpoint expects.
#[derive(Serialize)]
struct Envelope<'a> {
    message: &'a str,
}

/// Encode the message payload into the delivery body.
///
/// The payload is provisioned as bytes; non-UTF-8 sequences are replaced
/// rather than rejected so a garbled message still produces a valid body.
pub fn encode_body(message: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(message);
    let envelope = Envelope { message: &text };
    // Serialization of a borrowed string cannot fail.
    serde_json::to_vec(&envelope).unwrap_or_default()
}

/// A delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Transport-level failure before a status was received.
    Transport(String),
    /// The endpoint answered with a non-success status.
    Rejected(u16),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(reason) => write!(f, "delivery transport failure: {}", reason),
            Self::Rejected(status) => write!(f, "delivery rejected with status {}", status),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// One remote delivery attempt.
pub trait DeliveryClient: Send {
    /// Post `body` to the fixed endpoint. No partial-delivery semantics.
    fn deliver(&mut self, body: &[u8]) -> Result<(), DeliveryError>;
}

#[cfg(feature = "esp32")]
pub use esp32::HttpDelivery;

#[cfg(feature = "esp32")]
mod esp32 {
    use super::*;

    use embedded_svc::http::client::Client;
    use embedded_svc::http::Method;
    use embedded_svc::io::Write;
    use esp_idf_svc::http::client::{Configuration as HttpConfiguration, EspHttpConnection};
    use log::{debug, info};

    /// HTTP delivery client over the ESP-IDF connection.
    pub struct HttpDelivery;

    impl HttpDelivery {
        pub fn new() -> Self {
            Self
        }
    }

    impl Default for HttpDelivery {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DeliveryClient for HttpDelivery {
        fn deliver(&mut self, body: &[u8]) -> Result<(), DeliveryError> {
            let connection = EspHttpConnection::new(&HttpConfiguration {
                crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
                ..Default::default()
            })
            .map_err(|e| DeliveryError::Transport(format!("{:?}", e)))?;
            let mut client = Client::wrap(connection);

            let content_length = body.len().to_string();
            let headers = [
                ("Content-Type", DELIVERY_CONTENT_TYPE),
                ("Content-Length", content_length.as_str()),
            ];

            let mut request = client
                .request(Method::Post, DELIVERY_URL, &headers)
                .map_err(|e| DeliveryError::Transport(format!("{:?}", e)))?;
            request
                .write_all(body)
                .map_err(|e| DeliveryError::Transport(format!("{:?}", e)))?;

            let response = request
                .submit()
                .map_err(|e| DeliveryError::Transport(format!("{:?}", e)))?;
            let status = response.status();
            debug!("delivery response status {}", status);

            if (200..300).contains(&status) {
                info!("message delivered");
                Ok(())
            } else {
                Err(DeliveryError::Rejected(status))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_body_wraps_message() {
        let body = encode_body(b"hello, gcp");
        assert_eq!(body, br#"{"message":"hello, gcp"}"#.to_vec());
    }

    #[test]
    fn test_encode_body_escapes_quotes() {
        let body = encode_body(br#"say "hi""#);
        let text = String::from_utf8(body).unwrap();
        assert_eq!(text, r#"{"message":"say \"hi\""}"#);
    }

    #[test]
    fn test_encode_body_replaces_invalid_utf8() {
        let body = encode_body(&[0xFF, b'o', b'k']);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("ok"));
    }

    #[test]
    fn test_delivery_error_display() {
        assert!(format!("{}", DeliveryError::Rejected(503)).contains("503"));
        assert!(format!("{}", DeliveryError::Transport("dns".into())).contains("dns"));
    }
}
