//! MIME type lookup for file-serving handlers.

use std::path::Path;

/// The content type assumed for a request body that arrives without a
/// `Content-Type` header, and for files with no known extension.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Returns the MIME type for a file path based on its extension.
pub fn mime_type_for_path(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(DEFAULT_MIME_TYPE)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions() {
        #[rustfmt::skip]
        let cases = [
            ("index.html", "text/html"),
            ("data.json",  "application/json"),
            ("style.css",  "text/css"),
            ("image.png",  "image/png"),
            ("notes.txt",  "text/plain"),
        ];

        for (name, expected) in cases {
            assert_eq!(mime_type_for_path(Path::new(name)), expected, "{name}");
        }
    }

    #[test]
    fn unknown_extension_falls_back() {
        assert_eq!(mime_type_for_path(Path::new("blob.zzzz")), DEFAULT_MIME_TYPE);
        assert_eq!(mime_type_for_path(Path::new("no_extension")), DEFAULT_MIME_TYPE);
    }
}
