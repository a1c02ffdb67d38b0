//! Content type lookup by file extension.

use std::path::Path;

use http::HeaderValue;
use mime_guess::Mime;
use mime_guess::mime::TEXT_HTML;

/// Returns the content type for `path`, `application/octet-stream` when
/// the extension is unknown.
///
/// `.php` files are served as HTML rather than as source.
pub fn mime_type(path: &Path) -> Mime {
    let is_php = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("php"));
    if is_php {
        return TEXT_HTML;
    }
    mime_guess::from_path(path).first_or_octet_stream()
}

/// [`mime_type`] as a `Content-Type` header value.
pub fn content_type(path: &Path) -> HeaderValue {
    HeaderValue::from_str(mime_type(path).as_ref())
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}
