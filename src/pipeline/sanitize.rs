use std::sync::LazyLock;

use html5ever::serialize::{SerializeOpts, serialize};
use html5ever::tendril::{StrTendril, TendrilSink};
use html5ever::{ParseOpts, parse_document};
use markup5ever_rcdom::{Handle, NodeData, RcDom, SerializableHandle};
use regex::Regex;
use thiserror::Error;

/// A code fence marker and whatever follows it on the same line.
static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("```.*").expect("code fence pattern is valid"));

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("could not parse HTML: {0}")]
    Parse(#[source] std::io::Error),

    #[error("could not render HTML: {0}")]
    Render(#[source] std::io::Error),

    #[error("rendered HTML is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

pub fn strip_code_fences(input: &str) -> String {
    CODE_FENCE.replace_all(input, "").into_owned()
}

/// Parses `input` as an HTML document and renders it back, closing and
/// repairing tags on the way.
pub fn format_html(input: &str) -> Result<String, FormatError> {
    let dom = parse_document(RcDom::default(), ParseOpts::default())
        .from_utf8()
        .read_from(&mut input.as_bytes())
        .map_err(FormatError::Parse)?;

    restore_leading_newlines(&dom.document);

    let document: SerializableHandle = dom.document.clone().into();
    let mut rendered = Vec::with_capacity(input.len() + 64);
    serialize(&mut rendered, &document, SerializeOpts::default()).map_err(FormatError::Render)?;

    Ok(String::from_utf8(rendered)?)
}

/// The parser drops the first newline after `<pre>`, `<textarea>` and
/// `<listing>`, and the serializer does not write it back. A text child that
/// still starts with a newline gets one extra, so a reparse keeps it.
fn restore_leading_newlines(root: &Handle) {
    let mut pending = vec![root.clone()];

    while let Some(node) = pending.pop() {
        let keeps_newline = match &node.data {
            NodeData::Element { name, .. } => {
                &*name.ns == "http://www.w3.org/1999/xhtml"
                    && matches!(&*name.local, "pre" | "textarea" | "listing")
            }
            _ => false,
        };

        if keeps_newline {
            if let Some(first) = node.children.borrow().first() {
                if let NodeData::Text { contents } = &first.data {
                    let mut text = contents.borrow_mut();
                    if text.starts_with('\n') {
                        *text = StrTendril::from(format!("\n{}", &**text));
                    }
                }
            }
        }

        pending.extend(node.children.borrow().iter().cloned());
    }
}

#[tracing::instrument(
    name = "pipeline_stage sanitize",
    skip(raw),
    fields(
        pipeline.stage = "sanitize",
        sanitize.input_bytes = raw.len(),
        sanitize.output_bytes,
    )
)]
pub fn sanitize(raw: &str) -> Result<String, FormatError> {
    let html = format_html(&strip_code_fences(raw))?;
    tracing::Span::current().record("sanitize.output_bytes", html.len());
    Ok(html)
}
