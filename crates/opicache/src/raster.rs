//! Logical rasters (8-bit, 1/3/4 interleaved bands, north-up) and their file
//! containers.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::error::{CacheError, Result};
use crate::geo::GeoTransform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    Png,
    Jpeg { quality: u8 },
}

impl RasterFormat {
    pub const GRAPH: RasterFormat = RasterFormat::Png;
    pub const ORTHO_JPEG_QUALITY: u8 = 90;

    /// Container for ortho and opi rasters with `bands` bands. JPEG cannot
    /// carry a fourth band.
    pub fn for_bands(bands: u8) -> RasterFormat {
        if bands == 4 {
            RasterFormat::Png
        } else {
            RasterFormat::Jpeg {
                quality: Self::ORTHO_JPEG_QUALITY,
            }
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            RasterFormat::Png => "png",
            RasterFormat::Jpeg { .. } => "jpg",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub bands: u8,
    pub geo: GeoTransform,
    /// Row-major, band-interleaved.
    pub data: Vec<u8>,
}

impl Raster {
    /// All-zero raster.
    pub fn blank(width: u32, height: u32, bands: u8, geo: GeoTransform) -> Self {
        Self {
            width,
            height,
            bands,
            geo,
            data: vec![0; width as usize * height as usize * bands as usize],
        }
    }

    #[inline]
    fn offset(&self, col: u32, row: u32) -> usize {
        (row as usize * self.width as usize + col as usize) * self.bands as usize
    }

    #[inline]
    pub fn pixel(&self, col: u32, row: u32) -> &[u8] {
        let o = self.offset(col, row);
        &self.data[o..o + self.bands as usize]
    }

    #[inline]
    pub fn pixel_mut(&mut self, col: u32, row: u32) -> &mut [u8] {
        let o = self.offset(col, row);
        let n = self.bands as usize;
        &mut self.data[o..o + n]
    }

    /// Decodes `path`; band count follows the file's color type (gray → 1,
    /// color → 3, color + alpha → 4).
    pub fn read(path: &Path, geo: GeoTransform) -> Result<Self> {
        let img = image::open(path)?;
        let color = img.color();
        let (width, height) = (img.width(), img.height());
        let (bands, data) = match (color.has_color(), color.has_alpha()) {
            (false, _) => (1, img.into_luma8().into_raw()),
            (true, false) => (3, img.into_rgb8().into_raw()),
            (true, true) => (4, img.into_rgba8().into_raw()),
        };
        Ok(Self {
            width,
            height,
            bands,
            geo,
            data,
        })
    }

    /// Like [`Raster::read`] but fails unless the file has `bands` bands.
    pub fn read_bands(path: &Path, geo: GeoTransform, bands: u8) -> Result<Self> {
        let r = Self::read(path, geo)?;
        if r.bands != bands {
            return Err(CacheError::BandMismatch {
                path: path.to_path_buf(),
                expected: bands,
                found: r.bands,
            });
        }
        Ok(r)
    }

    /// [`Raster::read_bands`] for a slab raster: the file must also be
    /// `width` x `height`.
    pub fn read_slab(path: &Path, geo: GeoTransform, bands: u8, (width, height): (u32, u32)) -> Result<Self> {
        let r = Self::read_bands(path, geo, bands)?;
        if (r.width, r.height) != (width, height) {
            return Err(CacheError::Georef {
                path: path.to_path_buf(),
                reason: format!("raster is {}x{}, slab is {width}x{height}", r.width, r.height),
            });
        }
        Ok(r)
    }

    pub fn write(&self, path: &Path, format: RasterFormat) -> Result<()> {
        let color = match self.bands {
            1 => ExtendedColorType::L8,
            3 => ExtendedColorType::Rgb8,
            4 => ExtendedColorType::Rgba8,
            n => {
                return Err(CacheError::BandMismatch {
                    path: path.to_path_buf(),
                    expected: 3,
                    found: n,
                })
            }
        };

        let mut writer = BufWriter::new(File::create(path)?);
        match format {
            RasterFormat::Png => {
                PngEncoder::new(&mut writer).write_image(&self.data, self.width, self.height, color)?
            }
            RasterFormat::Jpeg { quality } => JpegEncoder::new_with_quality(&mut writer, quality)
                .write_image(&self.data, self.width, self.height, color)?,
        }
        writer.flush()?;
        Ok(())
    }

    /// Interleaves a 3-band and a 1-band raster of identical size into 4
    /// bands.
    pub fn stack(rgb: &Raster, ir: &Raster) -> Option<Raster> {
        if rgb.bands != 3 || ir.bands != 1 || rgb.width != ir.width || rgb.height != ir.height {
            return None;
        }
        let mut data = Vec::with_capacity(ir.data.len() * 4);
        for (c, &i) in rgb.data.chunks_exact(3).zip(&ir.data) {
            data.extend_from_slice(c);
            data.push(i);
        }
        Some(Raster {
            width: rgb.width,
            height: rgb.height,
            bands: 4,
            geo: rgb.geo,
            data,
        })
    }
}
