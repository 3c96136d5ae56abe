//! Branding images: decoded once, embedded as image XObjects per output.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use lopdf::{Document, ObjectId, Stream, dictionary};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Where the branding images live on disk. Any of them may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetPaths {
    pub cover: Option<PathBuf>,
    pub left_logo: Option<PathBuf>,
    pub right_logo: Option<PathBuf>,
}

/// An 8-bit RGB raster with an optional alpha channel.
#[derive(Debug, Clone)]
pub struct RasterImage {
    pub width: u32,
    pub height: u32,
    rgb: Vec<u8>,
    alpha: Option<Vec<u8>>,
}

impl RasterImage {
    pub fn from_dynamic(img: &DynamicImage) -> Self {
        let alpha = img
            .color()
            .has_alpha()
            .then(|| img.to_rgba8().pixels().map(|p| p.0[3]).collect());
        Self {
            width: img.width(),
            height: img.height(),
            rgb: img.to_rgb8().into_raw(),
            alpha,
        }
    }

    /// Add this image (and its soft mask, if any) to `doc`.
    ///
    /// Streams are written raw; `Document::compress` deflates them when the
    /// output is finished.
    pub(crate) fn embed(&self, doc: &mut Document) -> ObjectId {
        let width = i64::from(self.width);
        let height = i64::from(self.height);

        let smask = self.alpha.as_ref().map(|alpha| {
            doc.add_object(Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => width,
                    "Height" => height,
                    "ColorSpace" => "DeviceGray",
                    "BitsPerComponent" => 8,
                },
                alpha.clone(),
            ))
        });

        let mut dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width,
            "Height" => height,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
        };
        if let Some(id) = smask {
            dict.set("SMask", id);
        }
        doc.add_object(Stream::new(dict, self.rgb.clone()))
    }
}

/// Decoded branding images shared by every composition.
#[derive(Debug, Clone, Default)]
pub struct BrandAssets {
    pub cover: Option<RasterImage>,
    pub left_logo: Option<RasterImage>,
    pub right_logo: Option<RasterImage>,
}

impl BrandAssets {
    /// Decode every configured image. An unreadable image is logged and
    /// left out: the cover page or that logo is then simply not drawn.
    pub fn load(paths: &AssetPaths) -> Self {
        Self {
            cover: load_optional("cover", paths.cover.as_deref()),
            left_logo: load_optional("left_logo", paths.left_logo.as_deref()),
            right_logo: load_optional("right_logo", paths.right_logo.as_deref()),
        }
    }

    /// No cover and no logos. Header bands are still drawn.
    pub fn none() -> Self {
        Self::default()
    }
}

fn load_optional(role: &str, path: Option<&Path>) -> Option<RasterImage> {
    let path = path?;
    match image::open(path) {
        Ok(img) => {
            debug!(role, path = %path.display(), width = img.width(), height = img.height(), "branding asset loaded");
            Some(RasterImage::from_dynamic(&img))
        }
        Err(e) => {
            warn!(role, path = %path.display(), error = %e, "branding asset unavailable, skipping");
            None
        }
    }
}
