// PIXEL CONVERT - Decoded frame to rotated panel
//
// The panel is mounted rotated 270°: the logical picture runs along its
// physical rows. A logical pixel (x', y') lands at physical row
// x' + letterbox, column stride - 1 - y'. Each source pixel is converted
// once and replicated into an N×N block for integer upscaling.
//
// YUV→RGB is BT.601 limited range in fixed point, driven entirely by
// lookup tables built once per converter.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decode::{chroma_size, DecodedFrame, FrameFormat};

/// Offset applied before indexing the clamp table
pub const CLAMP_BIAS: i32 = 384;
const CLAMP_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Surface buffer is {got} bytes, needs {needed}")]
    SurfaceTooSmall { needed: usize, got: usize },
    #[error("Frame buffer is {got} bytes, needs {needed}")]
    FrameTooSmall { needed: usize, got: usize },
    #[error("Frame has no pixels")]
    EmptyFrame,
}

// ============================================================================
// Surface
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurfaceFormat {
    Bgr888,
    Rgb888,
    Rgb565,
}

impl SurfaceFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Bgr888 | Self::Rgb888 => 3,
            Self::Rgb565 => 2,
        }
    }
}

/// A writable framebuffer, in physical panel coordinates
#[derive(Debug)]
pub struct Surface<'a> {
    pub data: &'a mut [u8],
    /// Pixels per physical row (the logical height)
    pub stride: usize,
    /// Physical rows (the logical width)
    pub rows: usize,
    pub format: SurfaceFormat,
}

impl<'a> Surface<'a> {
    pub fn new(
        data: &'a mut [u8],
        stride: usize,
        rows: usize,
        format: SurfaceFormat,
    ) -> Result<Self, ConvertError> {
        let surface = Self {
            data,
            stride,
            rows,
            format,
        };
        surface.check()?;
        Ok(surface)
    }

    pub fn byte_len(&self) -> usize {
        self.stride * self.rows * self.format.bytes_per_pixel()
    }

    fn check(&self) -> Result<(), ConvertError> {
        let needed = self.byte_len();
        if self.data.len() < needed {
            return Err(ConvertError::SurfaceTooSmall {
                needed,
                got: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn logical_width(&self) -> usize {
        self.rows
    }

    pub fn logical_height(&self) -> usize {
        self.stride
    }

    /// Fill with black
    pub fn clear(&mut self) {
        let len = self.byte_len().min(self.data.len());
        self.data[..len].fill(0);
    }
}

// ============================================================================
// Placement
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Upscale {
    /// Largest integer factor that fits, up to the configured cap
    Auto,
    Fixed(u32),
}

/// Where a frame goes on the surface, in logical coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub scale: u32,
    pub letterbox: usize,
    pub scaled_width: usize,
    pub scaled_height: usize,
    /// Part of the scaled frame that fits on the surface
    pub visible_width: usize,
    pub visible_height: usize,
}

impl Placement {
    pub fn compute(
        width: usize,
        height: usize,
        surface_width: usize,
        surface_height: usize,
        upscale: Upscale,
        max_upscale: u32,
    ) -> Self {
        let scale = match upscale {
            Upscale::Fixed(n) => n.max(1),
            Upscale::Auto => {
                let fit_w = surface_width / width.max(1);
                let fit_h = surface_height / height.max(1);
                (fit_w.min(fit_h) as u32).clamp(1, max_upscale.max(1))
            }
        };
        let scaled_width = width * scale as usize;
        let scaled_height = height * scale as usize;
        let letterbox = surface_width.saturating_sub(scaled_width) / 2;

        Self {
            scale,
            letterbox,
            scaled_width,
            scaled_height,
            visible_width: scaled_width.min(surface_width - letterbox),
            visible_height: scaled_height.min(surface_height),
        }
    }
}

// ============================================================================
// Pixel Writers
// ============================================================================

pub trait PixelWriter {
    const BYTES: usize;
    fn put(dst: &mut [u8], rgb: [u8; 3]);
}

pub struct Bgr888Writer;
pub struct Rgb888Writer;
pub struct Rgb565Writer;

impl PixelWriter for Bgr888Writer {
    const BYTES: usize = 3;
    #[inline(always)]
    fn put(dst: &mut [u8], [r, g, b]: [u8; 3]) {
        dst[0] = b;
        dst[1] = g;
        dst[2] = r;
    }
}

impl PixelWriter for Rgb888Writer {
    const BYTES: usize = 3;
    #[inline(always)]
    fn put(dst: &mut [u8], [r, g, b]: [u8; 3]) {
        dst[0] = r;
        dst[1] = g;
        dst[2] = b;
    }
}

impl PixelWriter for Rgb565Writer {
    const BYTES: usize = 2;
    #[inline(always)]
    fn put(dst: &mut [u8], [r, g, b]: [u8; 3]) {
        let packed = ((r as u16 & 0xF8) << 8) | ((g as u16 & 0xFC) << 3) | (b as u16 >> 3);
        dst[..2].copy_from_slice(&packed.to_le_bytes());
    }
}

// ============================================================================
// Pixel Sources
// ============================================================================

trait PixelSource {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    /// Convert source row `y` into `out`, one triplet per pixel
    fn row(&self, y: usize, out: &mut [[u8; 3]]);
}

struct I420Source<'a> {
    y: &'a [u8],
    u: &'a [u8],
    v: &'a [u8],
    stride: usize,
    chroma_stride: usize,
    width: usize,
    height: usize,
    tables: &'a FrameConverter,
}

impl PixelSource for I420Source<'_> {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn row(&self, y: usize, out: &mut [[u8; 3]]) {
        let luma = &self.y[y * self.stride..][..self.width];
        let c = (y / 2) * self.chroma_stride;
        let u = &self.u[c..][..self.chroma_stride];
        let v = &self.v[c..][..self.chroma_stride];

        // Each chroma sample covers a pair of luma samples
        for ((pair, luma), (&u, &v)) in out
            .chunks_mut(2)
            .zip(luma.chunks(2))
            .zip(u.iter().zip(v))
        {
            for (dst, &y) in pair.iter_mut().zip(luma) {
                *dst = self.tables.yuv_to_rgb(y, u, v);
            }
        }
    }
}

struct PackedSource<'a> {
    data: &'a [u8],
    stride: usize,
    width: usize,
    height: usize,
    bgr: bool,
}

impl PixelSource for PackedSource<'_> {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn row(&self, y: usize, out: &mut [[u8; 3]]) {
        let src = &self.data[y * self.stride..][..self.width * 3];
        for (dst, p) in out.iter_mut().zip(src.chunks_exact(3)) {
            *dst = if self.bgr {
                [p[2], p[1], p[0]]
            } else {
                [p[0], p[1], p[2]]
            };
        }
    }
}

// ============================================================================
// Frame Converter
// ============================================================================

pub struct FrameConverter {
    y_table: [i32; 256],
    v_table_r: [i32; 256],
    u_table_g: [i32; 256],
    v_table_g: [i32; 256],
    u_table_b: [i32; 256],
    clamp: [u8; CLAMP_LEN],
    upscale: Upscale,
    max_upscale: u32,
}

impl FrameConverter {
    pub fn new(upscale: Upscale, max_upscale: u32) -> Self {
        let mut converter = Self {
            y_table: [0; 256],
            v_table_r: [0; 256],
            u_table_g: [0; 256],
            v_table_g: [0; 256],
            u_table_b: [0; 256],
            clamp: [0; CLAMP_LEN],
            upscale,
            max_upscale,
        };
        converter.build_tables();
        converter
    }

    fn build_tables(&mut self) {
        for i in 0..256 {
            let y = i as i32 - 16;
            let c = i as i32 - 128;

            self.y_table[i] = (y * 298) >> 8; // 298/256 ≈ 1.164
            self.v_table_r[i] = (c * 359) >> 8;
            // Green terms are summed before the shift
            self.u_table_g[i] = c * 88;
            self.v_table_g[i] = c * 183;
            self.u_table_b[i] = (c * 454) >> 8;
        }
        for (i, entry) in self.clamp.iter_mut().enumerate() {
            *entry = (i as i32 - CLAMP_BIAS).clamp(0, 255) as u8;
        }
    }

    #[inline(always)]
    fn clamp(&self, value: i32) -> u8 {
        self.clamp[(value + CLAMP_BIAS) as usize]
    }

    #[inline(always)]
    pub fn yuv_to_rgb(&self, y: u8, u: u8, v: u8) -> [u8; 3] {
        let luma = self.y_table[y as usize];
        let (u, v) = (u as usize, v as usize);
        [
            self.clamp(luma + self.v_table_r[v]),
            self.clamp(luma - ((self.u_table_g[u] + self.v_table_g[v]) >> 8)),
            self.clamp(luma + self.u_table_b[u]),
        ]
    }

    pub fn placement(&self, width: usize, height: usize, surface: &Surface<'_>) -> Placement {
        Placement::compute(
            width,
            height,
            surface.logical_width(),
            surface.logical_height(),
            self.upscale,
            self.max_upscale,
        )
    }

    /// Draw a frame onto the surface. Letterbox bars are left untouched.
    pub fn convert(
        &self,
        frame: &DecodedFrame<'_>,
        surface: &mut Surface<'_>,
    ) -> Result<Placement, ConvertError> {
        surface.check()?;
        let width = frame.width as usize;
        let height = frame.height as usize;
        if width == 0 || height == 0 {
            return Err(ConvertError::EmptyFrame);
        }

        let placement = self.placement(width, height, surface);
        match surface.format {
            SurfaceFormat::Bgr888 => self.draw::<Bgr888Writer>(frame, surface, &placement)?,
            SurfaceFormat::Rgb888 => self.draw::<Rgb888Writer>(frame, surface, &placement)?,
            SurfaceFormat::Rgb565 => self.draw::<Rgb565Writer>(frame, surface, &placement)?,
        }
        Ok(placement)
    }

    fn draw<W: PixelWriter>(
        &self,
        frame: &DecodedFrame<'_>,
        surface: &mut Surface<'_>,
        placement: &Placement,
    ) -> Result<(), ConvertError> {
        let width = frame.width as usize;
        let height = frame.height as usize;
        let stride = frame.stride as usize;

        match frame.format {
            FrameFormat::I420 => {
                let luma = stride * height;
                let chroma = chroma_size(frame.width, frame.height);
                let needed = luma + 2 * chroma;
                if frame.data.len() < needed || stride < width {
                    return Err(ConvertError::FrameTooSmall {
                        needed,
                        got: frame.data.len(),
                    });
                }
                let source = I420Source {
                    y: &frame.data[..luma],
                    u: &frame.data[luma..luma + chroma],
                    v: &frame.data[luma + chroma..needed],
                    stride,
                    chroma_stride: (width + 1) / 2,
                    width,
                    height,
                    tables: self,
                };
                blit::<_, W>(&source, surface, placement);
            }
            FrameFormat::Rgb24 | FrameFormat::Bgr24 => {
                let needed = stride * (height - 1) + width * 3;
                if frame.data.len() < needed || stride < width * 3 {
                    return Err(ConvertError::FrameTooSmall {
                        needed,
                        got: frame.data.len(),
                    });
                }
                let source = PackedSource {
                    data: frame.data,
                    stride,
                    width,
                    height,
                    bgr: frame.format == FrameFormat::Bgr24,
                };
                blit::<_, W>(&source, surface, placement);
            }
        }
        Ok(())
    }
}

/// One source row at a time: it becomes a band of physical columns,
/// crossing every visible physical row once per source pixel replica.
fn blit<S: PixelSource, W: PixelWriter>(source: &S, surface: &mut Surface<'_>, placement: &Placement) {
    let scale = placement.scale as usize;
    let stride = surface.stride;
    let row_bytes = stride * W::BYTES;
    let mut line = vec![[0u8; 3]; source.width()];

    for sy in 0..source.height() {
        let y0 = sy * scale;
        if y0 >= placement.visible_height {
            break;
        }
        let y1 = (y0 + scale).min(placement.visible_height);
        // Logical rows y0..y1 are physical columns stride-y1..stride-y0
        let band = (stride - y1) * W::BYTES..(stride - y0) * W::BYTES;
        source.row(sy, &mut line);

        let rows = surface
            .data
            .chunks_exact_mut(row_bytes)
            .skip(placement.letterbox)
            .take(placement.visible_width);
        let pixels = line.iter().flat_map(|rgb| std::iter::repeat(rgb).take(scale));
        for (row, &rgb) in rows.zip(pixels) {
            for dst in row[band.clone()].chunks_exact_mut(W::BYTES) {
                W::put(dst, rgb);
            }
        }
    }
}
