//! Outgoing message assembly
//!
//! Builds a lettre MIME message from [`SendOptions`]; used both by the
//! SMTP transport and by Gmail's raw-send endpoint. Attachment sources
//! are resolved here so every send path validates them the same way.

use lettre::message::header::ContentType;
use lettre::message::{Attachment as LettreAttachment, Body, Mailbox, MultiPart, SinglePart};
use lettre::Message as LettreMessage;

use crate::types::{Address, AttachmentSource, SendOptions};
use crate::{MailError, Result};

/// Build the full message. `message_id` becomes its Message-ID header.
pub async fn build_mime(
    http: &reqwest::Client,
    from: &Address,
    opts: &SendOptions,
    message_id: &str,
) -> Result<LettreMessage> {
    if opts.to.is_empty() && opts.cc.is_empty() && opts.bcc.is_empty() {
        return Err(MailError::InvalidInput("no recipients".into()));
    }

    let mut builder = LettreMessage::builder()
        .from(parse_mailbox(from)?)
        .subject(&opts.subject)
        .message_id(Some(message_id.to_string()));

    for addr in &opts.to {
        builder = builder.to(parse_mailbox(addr)?);
    }
    for addr in &opts.cc {
        builder = builder.cc(parse_mailbox(addr)?);
    }
    for addr in &opts.bcc {
        builder = builder.bcc(parse_mailbox(addr)?);
    }
    if let Some(reply) = &opts.in_reply_to {
        builder = builder.in_reply_to(reply.clone());
    }
    if !opts.references.is_empty() {
        builder = builder.references(opts.references.join(" "));
    }

    let alternative = match (&opts.body_text, &opts.body_html) {
        (Some(text), Some(html)) => Some(
            MultiPart::alternative()
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_PLAIN)
                        .body(text.clone()),
                )
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_HTML)
                        .body(html.clone()),
                ),
        ),
        _ => None,
    };

    let result = if opts.attachments.is_empty() {
        match alternative {
            Some(alt) => builder.multipart(alt),
            None => {
                let (content, kind) = single_body(opts);
                builder.header(kind).body(content)
            }
        }
    } else {
        let mut mixed = match alternative {
            Some(alt) => MultiPart::mixed().multipart(alt),
            None => {
                let (content, kind) = single_body(opts);
                MultiPart::mixed()
                    .singlepart(SinglePart::builder().header(kind).body(content))
            }
        };
        for source in &opts.attachments {
            let (filename, content_type, data) = resolve_attachment(http, source).await?;
            let content_type = ContentType::parse(&content_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|e| MailError::InvalidInput(format!("bad content type: {e}")))?;
            mixed = mixed
                .singlepart(LettreAttachment::new(filename).body(Body::new(data), content_type));
        }
        builder.multipart(mixed)
    };

    result.map_err(|e| MailError::InvalidInput(e.to_string()))
}

fn single_body(opts: &SendOptions) -> (String, ContentType) {
    match (&opts.body_text, &opts.body_html) {
        (_, Some(html)) => (html.clone(), ContentType::TEXT_HTML),
        (Some(text), None) => (text.clone(), ContentType::TEXT_PLAIN),
        (None, None) => (String::new(), ContentType::TEXT_PLAIN),
    }
}

pub fn parse_mailbox(addr: &Address) -> Result<Mailbox> {
    addr.to_string()
        .parse()
        .map_err(|e: lettre::address::AddressError| {
            MailError::InvalidInput(format!("invalid address {}: {e}", addr.address))
        })
}

/// Resolve a source to `(filename, mime type, bytes)`.
async fn resolve_attachment(
    http: &reqwest::Client,
    source: &AttachmentSource,
) -> Result<(String, String, Vec<u8>)> {
    match source {
        AttachmentSource::Buffer {
            filename,
            content_type,
            data,
        } => Ok((
            filename.clone(),
            content_type
                .clone()
                .unwrap_or_else(|| guess_mime(filename).to_string()),
            data.clone(),
        )),
        AttachmentSource::File {
            path,
            filename,
            content_type,
        } => {
            let data = tokio::fs::read(path)
                .await
                .map_err(|e| MailError::InvalidInput(format!("attachment {path} unreadable: {e}")))?;
            let name = filename.clone().unwrap_or_else(|| {
                std::path::Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "attachment".to_string())
            });
            let mime = content_type
                .clone()
                .unwrap_or_else(|| guess_mime(&name).to_string());
            Ok((name, mime, data))
        }
        AttachmentSource::Url {
            url,
            filename,
            content_type,
        } => {
            let resp = http.get(url).send().await?.error_for_status()?;
            let mime = content_type.clone().unwrap_or_else(|| {
                resp.headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| guess_mime(filename).to_string())
            });
            let data = resp.bytes().await?.to_vec();
            Ok((filename.clone(), mime, data))
        }
    }
}

fn guess_mime(filename: &str) -> &'static str {
    match filename.rsplit('.').next().map(str::to_lowercase).as_deref() {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("txt") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        Some("doc") => "application/msword",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("xls") => "application/vnd.ms-excel",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_guessing_by_extension() {
        assert_eq!(guess_mime("report.PDF"), "application/pdf");
        assert_eq!(guess_mime("photo.jpeg"), "image/jpeg");
        assert_eq!(guess_mime("noext"), "application/octet-stream");
    }

    #[test]
    fn mailbox_parsing_rejects_garbage() {
        assert!(parse_mailbox(&Address::new("not an address")).is_err());
        assert!(parse_mailbox(&Address::named("Jane", "jane@example.com")).is_ok());
    }

    #[tokio::test]
    async fn requires_recipients() {
        let http = reqwest::Client::new();
        let opts = SendOptions {
            subject: "hi".into(),
            body_text: Some("hello".into()),
            ..Default::default()
        };
        let err = build_mime(&http, &Address::new("me@example.com"), &opts, "<id@mailsync>")
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn buffer_attachment_builds_multipart() {
        let http = reqwest::Client::new();
        let opts = SendOptions {
            to: vec![Address::new("to@example.com")],
            subject: "files".into(),
            body_text: Some("see attached".into()),
            attachments: vec![AttachmentSource::Buffer {
                filename: "data.csv".into(),
                content_type: None,
                data: b"a,b\n1,2\n".to_vec(),
            }],
            ..Default::default()
        };
        let msg = build_mime(&http, &Address::new("me@example.com"), &opts, "<id@mailsync>")
            .await
            .unwrap();
        let rendered = String::from_utf8(msg.formatted()).unwrap();
        assert!(rendered.contains("multipart/mixed"));
        assert!(rendered.contains("data.csv"));
        assert!(rendered.contains("text/csv"));
    }
}
