use std::fs;
use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde_json::{json, Value};

use super::error::{RenderError, StyleError};
use super::style::StyleInfo;
use super::task::{OutputFormat, RenderOutput, RenderRequest, SubtileRequest};

/// Seam to the actual rasterizer.
///
/// A worker drives this to build compiled styles and to execute tile work;
/// the heavyweight renderer is an external collaborator behind this trait.
/// Calls may block: they only ever run on a render-worker thread.
pub trait RenderBackend: Send + Sync + 'static {
    type Style: Send + Sync + 'static;

    /// Builds a compiled style from its on-disk definition.
    fn compile(&self, info: &StyleInfo) -> Result<Self::Style, StyleError>;

    /// Renders one tile (or metatile) of a compiled style.
    fn render(&self, style: &Self::Style, request: &RenderRequest)
        -> Result<RenderOutput, RenderError>;

    /// Derives a deeper-zoom tile from a parent vector tile.
    fn make_subtile(&self, request: &SubtileRequest) -> Result<RenderOutput, RenderError>;
}

pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Minimal built-in backend.
///
/// Compiles style JSON documents, rasterizes only the background layer, and
/// serves subtiles by overzoom passthrough. Enough to run the server end to
/// end without an external rasterizer.
pub struct FlatBackend {
    tile_size: u32,
}

impl FlatBackend {
    #[must_use]
    pub fn new(tile_size: u32) -> Self {
        Self { tile_size }
    }
}

impl Default for FlatBackend {
    fn default() -> Self {
        Self::new(DEFAULT_TILE_SIZE)
    }
}

/// Compiled form of a style document as far as [`FlatBackend`] understands it.
pub struct FlatStyle {
    background: Rgba<u8>,
}

impl RenderBackend for FlatBackend {
    type Style = FlatStyle;

    fn compile(&self, info: &StyleInfo) -> Result<FlatStyle, StyleError> {
        let contents = fs::read_to_string(&info.path).map_err(|source| StyleError::Read {
            name: info.name.clone(),
            path: info.path.clone(),
            source,
        })?;
        let doc: Value = serde_json::from_str(&contents).map_err(|source| StyleError::Parse {
            name: info.name.clone(),
            path: info.path.clone(),
            source,
        })?;
        if doc.get("version").and_then(Value::as_u64).is_none() {
            return Err(StyleError::Invalid {
                name: info.name.clone(),
                message: "style document has no version".to_string(),
            });
        }
        Ok(FlatStyle {
            background: background_color(&doc),
        })
    }

    fn render(
        &self,
        style: &FlatStyle,
        request: &RenderRequest,
    ) -> Result<RenderOutput, RenderError> {
        if request.render_grid {
            return Ok(RenderOutput {
                data: empty_grid(),
                format: OutputFormat::UtfGrid,
            });
        }
        let width = self.tile_size * request.metatile.width.max(1);
        let height = self.tile_size * request.metatile.height.max(1);
        let image = RgbaImage::from_pixel(width, height, style.background);
        let mut data = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image).write_to(&mut data, ImageFormat::Png)?;
        Ok(RenderOutput {
            data: data.into_inner(),
            format: OutputFormat::Png,
        })
    }

    fn make_subtile(&self, request: &SubtileRequest) -> Result<RenderOutput, RenderError> {
        let parent = &request.mvt_tile;
        if !parent.id.is_ancestor_of(&request.target) {
            return Err(RenderError::NotSubtile {
                parent: parent.id,
                target: request.target,
            });
        }
        Ok(RenderOutput {
            data: parent.data.clone(),
            format: OutputFormat::Mvt,
        })
    }
}

fn background_color(doc: &Value) -> Rgba<u8> {
    doc.get("layers")
        .and_then(Value::as_array)
        .and_then(|layers| {
            layers
                .iter()
                .find(|layer| layer.get("type").and_then(Value::as_str) == Some("background"))
        })
        .and_then(|layer| layer.get("paint"))
        .and_then(|paint| paint.get("background-color"))
        .and_then(Value::as_str)
        .and_then(parse_color)
        .unwrap_or(Rgba([0, 0, 0, 0]))
}

fn parse_color(value: &str) -> Option<Rgba<u8>> {
    let hex = value.strip_prefix('#')?;
    let component = |at: usize| u8::from_str_radix(hex.get(at * 2..at * 2 + 2)?, 16).ok();
    match hex.len() {
        3 => {
            let nibble =
                |at: usize| u8::from_str_radix(hex.get(at..=at)?, 16).ok().map(|v| v * 17);
            Some(Rgba([nibble(0)?, nibble(1)?, nibble(2)?, 255]))
        }
        6 => Some(Rgba([component(0)?, component(1)?, component(2)?, 255])),
        8 => Some(Rgba([
            component(0)?,
            component(1)?,
            component(2)?,
            component(3)?,
        ])),
        _ => None,
    }
}

fn empty_grid() -> Vec<u8> {
    serde_json::to_vec(&json!({"grid": [], "keys": [], "data": {}})).unwrap_or_default()
}
