//! URL-or-body target: load a DOM from the `url` location or the body,
//! expanding external entities only when `xxe=true`.

use super::{TargetContext, Transcript};
use crate::fetch::BlockingEntityLoader;
use crate::protocol::HttpRequest;
use crate::xml::{save_xml, Document, DocumentLoader, EntityExpansion};
use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::{debug, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Build the response body for a request.
pub async fn handle(request: &HttpRequest, ctx: &TargetContext) -> Bytes {
    let mut out = Transcript::new(ctx.inline_warnings);

    // A failed fetch leaves the content empty; the body is never a fallback
    let content = match request.query_param("url").filter(|url| !url.is_empty()) {
        Some(location) => match ctx.fetcher.fetch(location).await {
            Ok(content) => content,
            Err(e) => {
                warn!(url = location, error = %e, "Fetch failed");
                out.warning(format!("Fetching '{}' failed: {}", location, e));
                Bytes::new()
            }
        },
        None => request.body.clone(),
    };
    out.echo(&content);

    let expansion = EntityExpansion::from_flag(request.query_param("xxe"));
    debug!(?expansion, bytes = content.len(), "Loading document");

    let document = match load(content, expansion, ctx).await {
        Ok(document) => {
            if let Some(root) = document.root() {
                debug!(root = %root.name, "Document loaded");
            }
            document
        }
        Err(e) => {
            warn!(error = %e, "Document load failed");
            out.warning(format!("Loading document failed: {}", e));
            return out.finish();
        }
    };

    match save_xml(&document) {
        Ok(xml) => out.raw(&xml),
        Err(e) => {
            warn!(error = %e, "Serialization failed");
            out.warning(e);
        }
    }

    out.finish()
}

async fn load(
    content: Bytes,
    expansion: EntityExpansion,
    ctx: &TargetContext,
) -> Result<Document, BoxError> {
    match expansion {
        EntityExpansion::Disabled => Ok(Document::parse(&content)?),
        EntityExpansion::Enabled => {
            // Entity loads block on the fetcher, so the whole load leaves the worker
            let mut loader = BlockingEntityLoader::new(ctx.fetcher.clone(), Handle::current());
            let document = tokio::task::spawn_blocking(move || {
                DocumentLoader::new(EntityExpansion::Enabled, &mut loader).load(&content)
            })
            .await??;
            Ok(document)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::test_server::serve;
    use crate::fetch::Fetcher;
    use crate::protocol::{ParseResult, Parser};
    use crate::targets::SEPARATOR;
    use std::io::Write;
    use url::Url;

    fn context() -> TargetContext {
        TargetContext {
            fetcher: Fetcher::new(Some(std::time::Duration::from_secs(5)), "test").unwrap(),
            inline_warnings: true,
        }
    }

    fn request(target: &str, body: &[u8]) -> HttpRequest {
        let raw = format!("POST {} HTTP/1.1\r\nHost: test\r\n\r\n", target);
        match Parser::parse_head(raw.as_bytes()) {
            ParseResult::Complete(head, _) => HttpRequest::new(head, Bytes::copy_from_slice(body)),
            other => panic!("unexpected: {:?}", other),
        }
    }

    fn text(body: Bytes) -> String {
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn secret_file(contents: &str) -> (tempfile::NamedTempFile, String) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let url = Url::from_file_path(file.path()).unwrap().to_string();
        (file, url)
    }

    fn xxe_document(url: &str) -> String {
        format!(
            r#"<?xml version="1.0"?><!DOCTYPE r [<!ENTITY xxe SYSTEM "{}">]><r>&xxe;</r>"#,
            url
        )
    }

    #[tokio::test]
    async fn test_body_round_trip() {
        let input = b"<a x=\"1\">hello<b>world</b><c/></a>";
        let out = text(handle(&request("/xmldom.php", input), &context()).await);
        assert_eq!(
            out,
            format!(
                "<a x=\"1\">hello<b>world</b><c/></a>\n{}\n<?xml version=\"1.0\"?>\n<a x=\"1\">hello<b>world</b><c/></a>\n",
                SEPARATOR
            )
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_trip_independent_of_flag() {
        let input = b"<a><!-- note --><b>text</b></a>";
        let plain = handle(&request("/xmldom.php", input), &context()).await;
        let expanded = handle(&request("/xmldom.php?xxe=true", input), &context()).await;
        assert_eq!(plain, expanded);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_external_entity_expanded_only_with_flag() {
        let (_file, url) = secret_file("top-secret-value");
        let input = xxe_document(&url);

        let out = text(handle(&request("/xmldom.php?xxe=true", input.as_bytes()), &context()).await);
        assert!(out.ends_with("<r>top-secret-value</r>\n"), "{}", out);

        for target in ["/xmldom.php", "/xmldom.php?xxe=TRUE", "/xmldom.php?xxe=1", "/xmldom.php?xxe="] {
            let out = text(handle(&request(target, input.as_bytes()), &context()).await);
            assert!(!out.contains("top-secret-value"), "{}: {}", target, out);
            assert!(out.ends_with("<r>&xxe;</r>\n"), "{}: {}", target, out);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_url_replaces_body() {
        let (_doc, doc_url) = secret_file("<fetched>remote</fetched>");
        let target = format!(
            "/xmldom.php?url={}",
            url::form_urlencoded::byte_serialize(doc_url.as_bytes()).collect::<String>()
        );

        let out = text(handle(&request(&target, b"<body>ignored</body>"), &context()).await);
        assert!(out.starts_with("<fetched>remote</fetched>\n"));
        assert!(!out.contains("ignored"));
        assert!(out.ends_with("<fetched>remote</fetched>\n"));
    }

    #[tokio::test]
    async fn test_url_over_http_replaces_body() {
        let base = serve(&[("/doc.xml", "<remote>served</remote>")]).await;
        let target = format!("/xmldom.php?url={}/doc.xml", base);

        let out = text(handle(&request(&target, b"<body>ignored</body>"), &context()).await);
        assert_eq!(
            out,
            format!(
                "<remote>served</remote>\n{}\n<?xml version=\"1.0\"?>\n<remote>served</remote>\n",
                SEPARATOR
            )
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_external_entity_over_http() {
        let base = serve(&[("/secret", "remote-secret")]).await;
        let input = xxe_document(&format!("{}/secret", base));

        let out = text(handle(&request("/xmldom.php?xxe=true", input.as_bytes()), &context()).await);
        assert!(out.ends_with("<r>remote-secret</r>\n"), "{}", out);

        let out = text(handle(&request("/xmldom.php", input.as_bytes()), &context()).await);
        assert!(!out.contains("remote-secret"), "{}", out);
    }

    #[test]
    fn test_empty_url_uses_body() {
        let request = request("/xmldom.php?url=", b"<b>body</b>");
        let out = text(tokio_test::block_on(handle(&request, &context())));
        assert!(out.starts_with("<b>body</b>\n"));
    }

    #[tokio::test]
    async fn test_fetch_failure_does_not_fall_back() {
        let out = text(
            handle(
                &request("/xmldom.php?url=%2Fno%2Fsuch%2Ffile.xml", b"<body>unused</body>"),
                &context(),
            )
            .await,
        );
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with("Warning: Fetching '/no/such/file.xml' failed"));
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], SEPARATOR);
        assert!(lines[3].starts_with("Warning: Loading document failed: Document is empty"));
        assert!(!out.contains("unused"));
    }

    #[tokio::test]
    async fn test_malformed_input_has_no_serialization() {
        let out = text(handle(&request("/xmldom.php", b"<a><b></a>"), &context()).await);
        let after = out.split(SEPARATOR).nth(1).unwrap();
        assert!(after.starts_with("\nWarning: Loading document failed"));
        assert!(!after.contains("<?xml"));
    }

    #[tokio::test]
    async fn test_warnings_can_be_disabled() {
        let mut ctx = context();
        ctx.inline_warnings = false;
        let out = text(handle(&request("/xmldom.php", b"not xml"), &ctx).await);
        assert_eq!(out, format!("not xml\n{}\n", SEPARATOR));
    }
}
