#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use lopdf::{dictionary, Document, Object};

/// A PDF with `pages` empty letter-size pages.
pub fn blank_pdf(pages: u32) -> Vec<u8> {
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

/// Write `config/dossier.toml` under `root` and return its path.
///
/// The base config points db and storage into `root`, disables the real
/// provider, declares two models and two stages, and makes uploads poll
/// without delay. `extra` is appended verbatim.
pub fn write_config(root: &Path, extra: &str) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let content = format!(
        r#"[db]
path = "{root}/data/dossier.sqlite"

[storage]
root = "{root}/store"

[provider]
kind = "disabled"

[[models]]
id = "model-a"
priority = 1

[[models]]
id = "model-b"
priority = 2

[upload]
max_attempts = 2
backoff_secs = 0
poll_interval_secs = 0
poll_timeout_secs = 5

[dispatcher]
workers = 2
claim_backoff_secs = 1

[[stages]]
title = "Visão Geral"
order = 1
kind = "generic"
mandatory_keys = ["summary"]
prompt = "Summarize the process."

[[stages]]
title = "Prazos"
order = 2
kind = "generic"
mandatory_keys = ["summary"]
prompt = "List every deadline."
{extra}
"#,
        root = root.display(),
        extra = extra
    );

    let config_path = config_dir.join("dossier.toml");
    fs::write(&config_path, content).unwrap();
    config_path
}
