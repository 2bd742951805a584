//! RFC 6455 §4 upgrade handshake.

use crate::http::request::RequestHead;
use crate::http::types::Method;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

/// Fixed GUID appended to the client key before hashing (RFC 6455 §1.3).
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// True when the request is a well-formed WebSocket upgrade: GET method,
/// `Upgrade: websocket`, `Connection` containing `upgrade`, version 13, and
/// a key that decodes to 16 bytes.
pub fn is_web_socket_request(head: &RequestHead) -> bool {
    head.method == Method::Get
        && head
            .headers
            .get("upgrade")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
        && head.headers.list_contains("connection", "upgrade")
        && head
            .headers
            .get("sec-websocket-version")
            .is_some_and(|v| v.trim() == "13")
        && head
            .headers
            .get("sec-websocket-key")
            .is_some_and(|key| BASE64.decode(key.trim()).map(|k| k.len()) == Ok(16))
}

/// Computes `Sec-WebSocket-Accept` for a client key:
/// `base64(SHA1(key || GUID))`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// The complete 101 response for an accepted upgrade.
pub(crate) fn handshake_response(client_key: &str, server_name: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Server: {}\r\n\
         \r\n",
        accept_key(client_key),
        server_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::types::{Headers, Version};

    fn upgrade_head(mutate: impl FnOnce(&mut Headers)) -> RequestHead {
        let mut headers = Headers::new();
        headers.set("Host", "localhost");
        headers.set("Upgrade", "websocket");
        headers.set("Connection", "keep-alive, Upgrade");
        headers.set("Sec-WebSocket-Version", "13");
        headers.set("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        mutate(&mut headers);

        RequestHead {
            method: Method::Get,
            version: Version::Http11,
            url: "http://localhost/ws".to_string(),
            path: "/ws".to_string(),
            query: None,
            headers,
        }
    }

    #[test]
    fn valid_upgrade_is_recognized() {
        assert!(is_web_socket_request(&upgrade_head(|_| {})));
    }

    #[test]
    fn broken_upgrades_are_refused() {
        #[rustfmt::skip]
        let mutations: Vec<Box<dyn FnOnce(&mut Headers)>> = vec![
            Box::new(|h: &mut Headers| h.set("Upgrade", "h2c")),
            Box::new(|h: &mut Headers| h.set("Connection", "keep-alive")),
            Box::new(|h: &mut Headers| h.set("Sec-WebSocket-Version", "8")),
            Box::new(|h: &mut Headers| h.set("Sec-WebSocket-Key", "short")),
            Box::new(|h: &mut Headers| h.set("Sec-WebSocket-Key", "")),
        ];

        for mutation in mutations {
            assert!(!is_web_socket_request(&upgrade_head(mutation)));
        }

        let mut head = upgrade_head(|_| {});
        head.method = Method::Post;
        assert!(!is_web_socket_request(&head));
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        // RFC 6455 §1.3 worked example
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn handshake_response_shape() {
        let response = handshake_response("dGhlIHNhbXBsZSBub25jZQ==", "embed_web");

        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Upgrade: websocket\r\n"));
        assert!(response.contains("Connection: Upgrade\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }
}
