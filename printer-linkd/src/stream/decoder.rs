use std::io::Cursor;
use std::sync::Arc;
use image::codecs::jpeg::JpegDecoder;
use image::{ImageDecoder, RgbaImage};
use crate::error::{LinkError, Result};

/// Parts this small cannot hold an image
const MIN_FRAME_BYTES: usize = 10;

/// Power-of-two factor that brings both edges within `max_resolution`
pub fn sample_size_for(width: u32, height: u32, max_resolution: u32) -> u32 {
    let max = max_resolution.max(1);
    let mut sample = 1u32;
    while (width / sample > max || height / sample > max) && sample < (1 << 16) {
        sample *= 2;
    }
    sample
}

pub struct DecodedFrame {
    pub image: Arc<RgbaImage>,
    /// Whether a pooled buffer was overwritten instead of allocating
    pub reused: bool,
}

/// Decodes frames into a small pool of reusable RGBA buffers.
///
/// JPEG data lands in a scratch buffer kept across frames and is then
/// box-sampled straight into a pooled image. The downsample factor is fixed by
/// the first frame of a session. Buffers are handed out round robin; one still
/// held by a consumer is replaced rather than overwritten.
pub struct FrameDecoder {
    max_resolution: u32,
    sample_size: Option<u32>,
    scratch: Vec<u8>,
    pool: Vec<Option<Arc<RgbaImage>>>,
    next: usize,
}

/// Decoded pixels waiting in the scratch buffer
struct Source<'a> {
    pixels: &'a [u8],
    width: usize,
    height: usize,
    channels: usize,
}

impl FrameDecoder {
    pub fn new(max_resolution: u32, pool_size: usize) -> Self {
        Self {
            max_resolution,
            sample_size: None,
            scratch: Vec::new(),
            pool: vec![None; pool_size.max(1)],
            next: 0,
        }
    }

    pub fn sample_size(&self) -> Option<u32> {
        self.sample_size
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Result<DecodedFrame> {
        if bytes.len() <= MIN_FRAME_BYTES {
            return Err(LinkError::TransientDecodeFailure(format!(
                "frame of {} bytes",
                bytes.len()
            )));
        }

        let jpeg = JpegDecoder::new(Cursor::new(bytes)).map_err(decode_failure)?;
        let (width, height) = jpeg.dimensions();
        let color = jpeg.color_type();
        let channels = color.channel_count() as usize;
        if color.bytes_per_pixel() as usize != channels || channels > 4 {
            return Err(LinkError::TransientDecodeFailure(format!(
                "unsupported color type {:?}",
                color
            )));
        }

        // Keeps its capacity, so same-sized frames do not reallocate
        self.scratch.resize(jpeg.total_bytes() as usize, 0);
        jpeg.read_image(&mut self.scratch).map_err(decode_failure)?;

        let sample = match self.sample_size {
            Some(sample) => sample,
            None => {
                let sample = sample_size_for(width, height, self.max_resolution);
                tracing::debug!("Frames are {}x{}, sampling by {}", width, height, sample);
                self.sample_size = Some(sample);
                sample
            }
        };

        let out_width = (width / sample).max(1);
        let out_height = (height / sample).max(1);

        let source = Source {
            pixels: &self.scratch,
            width: width as usize,
            height: height as usize,
            channels,
        };

        let index = self.next;
        self.next = (self.next + 1) % self.pool.len();
        let slot = &mut self.pool[index];

        let reused = slot
            .as_mut()
            .and_then(Arc::get_mut)
            .map_or(false, |buffer| buffer.dimensions() == (out_width, out_height));
        let frame = match slot.take() {
            Some(mut pooled) if reused => {
                if let Some(buffer) = Arc::get_mut(&mut pooled) {
                    downsample_into(&source, sample as usize, buffer);
                }
                pooled
            }
            _ => {
                let mut buffer = RgbaImage::new(out_width, out_height);
                downsample_into(&source, sample as usize, &mut buffer);
                Arc::new(buffer)
            }
        };

        *slot = Some(frame.clone());
        Ok(DecodedFrame { image: frame, reused })
    }

    #[cfg(test)]
    fn scratch_ptr(&self) -> *const u8 {
        self.scratch.as_ptr()
    }
}

fn decode_failure(e: image::ImageError) -> LinkError {
    LinkError::TransientDecodeFailure(e.to_string())
}

/// Average each `sample` x `sample` block of `source` into one RGBA pixel
fn downsample_into(source: &Source<'_>, sample: usize, target: &mut RgbaImage) {
    let out_width = target.width() as usize;
    let out_height = target.height() as usize;
    let out: &mut [u8] = target;

    for oy in 0..out_height {
        let y_end = ((oy + 1) * sample).min(source.height);
        for ox in 0..out_width {
            let x_end = ((ox + 1) * sample).min(source.width);
            let mut sum = [0u32; 4];
            let mut count = 0u32;

            for y in (oy * sample)..y_end {
                for x in (ox * sample)..x_end {
                    let offset = (y * source.width + x) * source.channels;
                    let rgba = to_rgba(&source.pixels[offset..offset + source.channels]);
                    for (total, value) in sum.iter_mut().zip(rgba) {
                        *total += value as u32;
                    }
                    count += 1;
                }
            }

            let count = count.max(1);
            let offset = (oy * out_width + ox) * 4;
            for (dst, total) in out[offset..offset + 4].iter_mut().zip(sum) {
                *dst = (total / count) as u8;
            }
        }
    }
}

fn to_rgba(pixel: &[u8]) -> [u8; 4] {
    match *pixel {
        [l] => [l, l, l, 255],
        [l, a] => [l, l, l, a],
        [r, g, b] => [r, g, b, 255],
        [r, g, b, a] => [r, g, b, a],
        _ => [0, 0, 0, 255],
    }
}
