//! PDF page counting and page-range extraction via `lopdf`.

use anyhow::{bail, Context, Result};
use lopdf::Document;

/// Number of pages in a PDF.
pub fn count_pages(bytes: &[u8]) -> Result<i64> {
    let doc = Document::load_mem(bytes).context("Failed to parse PDF")?;
    Ok(doc.get_pages().len() as i64)
}

/// Build a standalone PDF holding pages `start..=end` (1-based) of `source`.
pub fn extract_pages(source: &Document, start: u32, end: u32) -> Result<Vec<u8>> {
    let total = source.get_pages().len() as u32;
    if start == 0 || start > end || end > total {
        bail!(
            "page range {}-{} out of bounds for {} pages",
            start,
            end,
            total
        );
    }

    let mut doc = source.clone();
    let outside: Vec<u32> = (1..=total).filter(|p| *p < start || *p > end).collect();
    if !outside.is_empty() {
        doc.delete_pages(&outside);
        doc.prune_objects();
    }

    let mut out = Vec::new();
    doc.save_to(&mut out).context("Failed to write PDF chunk")?;
    Ok(out)
}

/// Split `bytes` into one PDF per inclusive, 1-based page range.
pub fn split_pages(bytes: &[u8], ranges: &[(i64, i64)]) -> Result<Vec<Vec<u8>>> {
    let source = Document::load_mem(bytes).context("Failed to parse PDF")?;
    ranges
        .iter()
        .map(|(start, end)| extract_pages(&source, *start as u32, *end as u32))
        .collect()
}

#[cfg(test)]
pub(crate) fn blank_pdf(pages: u32) -> Vec<u8> {
    use lopdf::{dictionary, Object};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::new();
    for _ in 0..pages {
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(page_id.into());
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}
