//! PDF and DOCX books: extraction, then ingestion and a grounded answer.

mod common;

use std::io::Write;

use common::*;
use folio::extract::{extract_text, MIME_DOCX, MIME_PDF};
use folio_core::models::Book;
use folio_core::session::{CancelToken, ChatSession};

/// Minimal valid PDF with one line of text. Offsets in the xref table are
/// computed from the bytes written so pdf-extract can parse it.
fn minimal_pdf_with_text(line: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", line);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(
        format!(
            "4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
            content.len(),
            content
        )
        .as_bytes(),
    );
    let o5 = out.len();
    out.extend_from_slice(b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n");
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

/// Minimal docx: one `<w:p>` per paragraph in `word/document.xml`.
fn minimal_docx(paragraphs: &[String]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| {
            let escaped = p
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('"', "&quot;");
            format!("<w:p><w:r><w:t xml:space=\"preserve\">{}</w:t></w:r></w:p>", escaped)
        })
        .collect();
    let xml = format!(
        "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
        body
    );

    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

#[test]
fn test_pdf_text_is_extracted() {
    let text = extract_text(&minimal_pdf_with_text("Call me Ishmael"), MIME_PDF).unwrap();
    assert!(text.contains("Call me Ishmael"), "got: {:?}", text);
}

#[test]
fn test_docx_keeps_paragraphs() {
    let text = extract_text(&minimal_docx(&courtship()), MIME_DOCX).unwrap();
    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    assert_eq!(paragraphs.len(), courtship().len());
    assert_eq!(paragraphs[0], "Mrs Bennet plans a ball for her daughters at Longbourn.");
    assert!(paragraphs[1].starts_with("\"I could easily forgive his pride"));
}

#[test]
fn test_docx_without_document_xml_is_malformed() {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/styles.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"<w:styles/>").unwrap();
        zip.finish().unwrap();
    }
    let err = extract_text(&buf, MIME_DOCX).unwrap_err();
    assert!(matches!(err, folio_core::Error::MalformedInput(_)));
}

#[tokio::test]
async fn test_docx_book_answers_with_citation() {
    let w = world();
    let text = extract_text(&minimal_docx(&courtship()), MIME_DOCX).unwrap();
    let mut b: Book = book("courtship", &[]);
    b.text = text;

    let report = w.app.ingest.ingest_now(&b).await.unwrap();
    assert_eq!(report.chunks, courtship().len());
    assert_eq!(report.characters, 1);

    let mut session = ChatSession::new(ids(&["courtship"]));
    let response = w
        .app
        .chat
        .chat(
            &mut session,
            "Why does Elizabeth refuse Darcy's proposal?",
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.response_text, ANSWER);
    assert!(response.evidence_used[0].text.contains("Hunsford"));
}
