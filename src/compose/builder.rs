//! Assembles an output document from imported source pages.

use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};

use super::ComposeError;
use super::HeaderStyle;
use super::assets::BrandAssets;
use super::layout::{
    A4_HEIGHT, A4_WIDTH, Anchor, HEADER_BAND_HEIGHT, LEFT_LOGO_SCALE, RIGHT_LOGO_SCALE,
    band_rect, logo_origin, scaled_to_height,
};

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Guards against cyclic `Parent` chains in broken files.
const MAX_TREE_DEPTH: usize = 64;

const COVER_NAME: &str = "LrCover";

pub(crate) struct OutputBuilder<'a> {
    doc: Document,
    pages_id: ObjectId,
    kids: Vec<ObjectId>,
    assets: &'a BrandAssets,
    overlay: Option<HeaderOverlay>,
    /// Shared `q` stream placed before original page content.
    save_state_id: Option<ObjectId>,
}

impl<'a> OutputBuilder<'a> {
    pub(crate) fn new(assets: &'a BrandAssets, style: HeaderStyle) -> Result<Self, ComposeError> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let overlay = HeaderOverlay::prepare(&mut doc, assets, style);
        Ok(Self {
            doc,
            pages_id,
            kids: Vec::new(),
            assets,
            overlay,
            save_state_id: None,
        })
    }

    /// Append a full-bleed A4 page showing the cover image. Without a cover
    /// image this is a no-op.
    pub(crate) fn push_cover(&mut self) -> Result<(), ComposeError> {
        let Some(cover) = self.assets.cover.as_ref() else {
            return Ok(());
        };
        let image_id = cover.embed(&mut self.doc);

        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        A4_WIDTH.into(),
                        0.into(),
                        0.into(),
                        A4_HEIGHT.into(),
                        0.into(),
                        0.into(),
                    ],
                ),
                Operation::new("Do", vec![Object::Name(COVER_NAME.as_bytes().to_vec())]),
                Operation::new("Q", vec![]),
            ],
        };
        let content_id = self
            .doc
            .add_object(Stream::new(Dictionary::new(), content.encode()?));

        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => a4_box(),
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { COVER_NAME => image_id },
            },
        });
        self.kids.push(page_id);
        Ok(())
    }

    /// Move every object of `source` into the output and return its page ids
    /// in page order. Pages are not yet part of the output's page tree.
    pub(crate) fn import(&mut self, mut source: Document) -> Result<Vec<ObjectId>, ComposeError> {
        let page_ids: Vec<ObjectId> = source.get_pages().into_values().collect();
        for page_id in page_ids {
            flatten_inherited(&mut source, page_id)?;
        }

        source.renumber_objects_with(self.doc.max_id + 1);
        let pages: Vec<ObjectId> = source.get_pages().into_values().collect();

        self.doc.max_id = self.doc.max_id.max(source.max_id);
        self.doc.objects.extend(source.objects);
        Ok(pages)
    }

    /// Append an imported page, drawing the header over it when `branded`.
    pub(crate) fn push_page(&mut self, page_id: ObjectId, branded: bool) -> Result<(), ComposeError> {
        if branded {
            if let Some(overlay) = self.overlay.as_ref() {
                let save_state_id = match self.save_state_id {
                    Some(id) => id,
                    None => {
                        let id = self
                            .doc
                            .add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
                        self.save_state_id = Some(id);
                        id
                    }
                };
                overlay.apply(&mut self.doc, page_id, save_state_id)?;
            }
        }

        self.doc
            .get_dictionary_mut(page_id)?
            .set("Parent", self.pages_id);
        self.kids.push(page_id);
        Ok(())
    }

    /// Build the page tree and catalog, drop unreachable objects, and
    /// compress streams.
    pub(crate) fn finish(mut self) -> Result<Document, ComposeError> {
        if self.kids.is_empty() {
            return Err(ComposeError::NoPages);
        }

        let count = self.kids.len() as i64;
        let kids: Vec<Object> = self.kids.iter().copied().map(Object::Reference).collect();
        self.doc.objects.insert(
            self.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);

        self.doc.prune_objects();
        self.doc.compress();
        Ok(self.doc)
    }
}

/// The header band and the logos drawn into it. Image XObjects are embedded
/// once per output document and shared by every branded page.
struct HeaderOverlay {
    logos: Vec<PlacedLogo>,
}

struct PlacedLogo {
    name: &'static str,
    xobject: ObjectId,
    anchor: Anchor,
    width: f32,
    height: f32,
}

impl HeaderOverlay {
    fn prepare(doc: &mut Document, assets: &BrandAssets, style: HeaderStyle) -> Option<Self> {
        let mut logos = Vec::new();
        match style {
            HeaderStyle::None => return None,
            HeaderStyle::White => {}
            HeaderStyle::Branded => {
                let slots = [
                    ("LrLogoL", assets.left_logo.as_ref(), Anchor::Left, LEFT_LOGO_SCALE),
                    ("LrLogoR", assets.right_logo.as_ref(), Anchor::Right, RIGHT_LOGO_SCALE),
                ];
                for (name, image, anchor, scale) in slots {
                    let Some(image) = image else { continue };
                    let (width, height) =
                        scaled_to_height(image.width, image.height, HEADER_BAND_HEIGHT * scale);
                    logos.push(PlacedLogo {
                        name,
                        xobject: image.embed(doc),
                        anchor,
                        width,
                        height,
                    });
                }
            }
        }
        Some(Self { logos })
    }

    fn operations(&self, media_box: [f32; 4]) -> Vec<Operation> {
        let (x, y, w, h) = band_rect(media_box);
        let mut ops = vec![
            Operation::new(
                "BDC",
                vec![
                    Object::Name(b"Artifact".to_vec()),
                    Object::Dictionary(dictionary! {
                        "Type" => "Pagination",
                        "Subtype" => "Header",
                    }),
                ],
            ),
            Operation::new("q", vec![]),
            Operation::new("rg", vec![1.into(), 1.into(), 1.into()]),
            Operation::new("re", vec![x.into(), y.into(), w.into(), h.into()]),
            Operation::new("f", vec![]),
            Operation::new("Q", vec![]),
        ];
        for logo in &self.logos {
            let (lx, ly) = logo_origin(media_box, logo.anchor, logo.width, logo.height);
            ops.extend([
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        logo.width.into(),
                        0.into(),
                        0.into(),
                        logo.height.into(),
                        lx.into(),
                        ly.into(),
                    ],
                ),
                Operation::new("Do", vec![Object::Name(logo.name.as_bytes().to_vec())]),
                Operation::new("Q", vec![]),
            ]);
        }
        ops.push(Operation::new("EMC", vec![]));
        ops
    }

    /// Wrap the page's content in `q … Q` and append the header after it.
    fn apply(&self, doc: &mut Document, page_id: ObjectId, save_state_id: ObjectId) -> Result<(), ComposeError> {
        let media_box = media_box(doc, page_id);

        let mut bytes = b"Q\n".to_vec();
        bytes.extend(
            Content {
                operations: self.operations(media_box),
            }
            .encode()?,
        );
        let overlay_id = doc.add_object(Stream::new(Dictionary::new(), bytes));

        let mut contents = vec![Object::Reference(save_state_id)];
        contents.extend(content_refs(doc, page_id)?);
        contents.push(Object::Reference(overlay_id));

        let resources = self.resources_with_logos(doc, page_id)?;
        let page = doc.get_dictionary_mut(page_id)?;
        page.set("Contents", contents);
        if let Some(resources) = resources {
            page.set("Resources", resources);
        }
        Ok(())
    }

    /// The page's resource dictionary with the logo XObjects added, or
    /// `None` when there are no logos to reference.
    fn resources_with_logos(&self, doc: &Document, page_id: ObjectId) -> Result<Option<Dictionary>, ComposeError> {
        if self.logos.is_empty() {
            return Ok(None);
        }
        let page = doc.get_dictionary(page_id)?;
        let mut resources = page
            .get(b"Resources")
            .ok()
            .and_then(|obj| resolve(doc, obj).as_dict().ok())
            .cloned()
            .unwrap_or_else(Dictionary::new);
        let mut xobjects = resources
            .get(b"XObject")
            .ok()
            .and_then(|obj| resolve(doc, obj).as_dict().ok())
            .cloned()
            .unwrap_or_else(Dictionary::new);

        for logo in &self.logos {
            xobjects.set(logo.name, logo.xobject);
        }
        resources.set("XObject", xobjects);
        Ok(Some(resources))
    }
}

fn a4_box() -> Vec<Object> {
    vec![0.into(), 0.into(), A4_WIDTH.into(), A4_HEIGHT.into()]
}

/// Follow one level of indirection.
fn resolve<'d>(doc: &'d Document, obj: &'d Object) -> &'d Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

/// Effective MediaBox of a page; A4 when absent or unreadable.
fn media_box(doc: &Document, page_id: ObjectId) -> [f32; 4] {
    let values: Option<Vec<f32>> = doc
        .get_dictionary(page_id)
        .ok()
        .and_then(|page| page.get(b"MediaBox").ok())
        .and_then(|obj| resolve(doc, obj).as_array().ok())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| resolve(doc, item).as_float().ok())
                .collect()
        });

    match values.as_deref() {
        Some(&[x0, y0, x1, y1]) => [x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)],
        _ => [0.0, 0.0, A4_WIDTH, A4_HEIGHT],
    }
}

/// The page's content streams as a list of references.
fn content_refs(doc: &Document, page_id: ObjectId) -> Result<Vec<Object>, ComposeError> {
    let page = doc.get_dictionary(page_id)?;
    let Ok(contents) = page.get(b"Contents") else {
        return Ok(Vec::new());
    };
    match contents {
        Object::Reference(id) => match doc.get_object(*id)? {
            Object::Array(items) => Ok(items.clone()),
            _ => Ok(vec![Object::Reference(*id)]),
        },
        Object::Array(items) => Ok(items.clone()),
        _ => Err(ComposeError::Malformed(format!(
            "page {page_id:?} has a Contents entry that is neither a stream nor an array"
        ))),
    }
}

/// Copy inherited attributes onto the page so it no longer depends on the
/// source page tree it is about to leave.
fn flatten_inherited(doc: &mut Document, page_id: ObjectId) -> Result<(), ComposeError> {
    let mut inherited = Vec::new();
    {
        let page = doc.get_dictionary(page_id)?;
        for key in INHERITABLE {
            if page.has(key) {
                continue;
            }
            if let Some(value) = find_inherited(doc, page, key) {
                inherited.push((key, value));
            }
        }
    }

    let page = doc.get_dictionary_mut(page_id)?;
    for (key, value) in inherited {
        page.set(key, value);
    }
    Ok(())
}

fn find_inherited(doc: &Document, page: &Dictionary, key: &[u8]) -> Option<Object> {
    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    for _ in 0..MAX_TREE_DEPTH {
        let node = doc.get_dictionary(parent?).ok()?;
        if let Ok(value) = node.get(key) {
            return Some(value.clone());
        }
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    None
}
