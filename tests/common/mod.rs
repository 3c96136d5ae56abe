//! Shared fixtures: a temp-file job store on a manual clock, generated PDFs,
//! and generated branding images.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use image::{Rgba, RgbaImage};
use labrelay::clock::ManualClock;
use labrelay::compose::{AssetPaths, BrandAssets};
use labrelay::db::{JobStore, StoreConfig};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};
use tempfile::TempDir;

pub struct TestStore {
    pub dir: TempDir,
    pub store: JobStore,
    pub clock: Arc<ManualClock>,
}

pub async fn test_store() -> TestStore {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap(),
    ));
    let store = JobStore::open(
        dir.path().join("jobs.db"),
        StoreConfig::default(),
        clock.clone(),
    )
    .await
    .unwrap();
    TestStore { dir, store, clock }
}

pub fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

/// A PDF of `pages` pages; page `i` (1-based) shows the text
/// `"<label> page <i>"`. MediaBox and Resources live on the page tree root,
/// so pages only have them by inheritance.
pub fn pdf_with_pages(label: &str, pages: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for i in 1..=pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![72.into(), 400.into()]),
                Operation::new(
                    "Tj",
                    vec![Object::string_literal(format!("{label} page {i}"))],
                ),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

pub fn write_pdf(dir: &Path, name: &str, label: &str, pages: usize) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, pdf_with_pages(label, pages)).unwrap();
    path
}

pub fn write_png(path: &Path, width: u32, height: u32) {
    RgbaImage::from_pixel(width, height, Rgba([200, 30, 30, 255]))
        .save(path)
        .unwrap();
}

/// Cover plus both logos, written as PNGs under `dir`.
pub fn brand_assets(dir: &Path) -> BrandAssets {
    let paths = AssetPaths {
        cover: Some(dir.join("cover.png")),
        left_logo: Some(dir.join("left.png")),
        right_logo: Some(dir.join("right.png")),
    };
    write_png(paths.cover.as_deref().unwrap(), 60, 85);
    write_png(paths.left_logo.as_deref().unwrap(), 40, 20);
    write_png(paths.right_logo.as_deref().unwrap(), 30, 30);
    BrandAssets::load(&paths)
}

/// Page ids in page order.
pub fn page_ids(doc: &Document) -> Vec<ObjectId> {
    doc.get_pages().into_values().collect()
}

/// Decoded content of every content stream on the page, concatenated.
pub fn page_text(doc: &Document, page_id: ObjectId) -> String {
    String::from_utf8_lossy(&doc.get_page_content(page_id).unwrap()).into_owned()
}

pub fn is_branded(doc: &Document, page_id: ObjectId) -> bool {
    page_text(doc, page_id).contains("/Pagination")
}
