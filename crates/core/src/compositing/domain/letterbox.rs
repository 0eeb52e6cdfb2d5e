use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::s;

use crate::shared::frame::Frame;

/// Where the scaled source lands on the canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Placement {
    /// Computes the aspect-preserving fit of `src` inside `canvas`.
    ///
    /// Relatively wider sources fill the canvas width and are centred
    /// vertically; everything else fills the height and is centred
    /// horizontally. The result never exceeds the canvas.
    pub fn fit(src_width: u32, src_height: u32, canvas_width: u32, canvas_height: u32) -> Self {
        let src_ratio = src_width as f64 / src_height as f64;
        let dst_ratio = canvas_width as f64 / canvas_height as f64;

        if src_ratio > dst_ratio {
            let height = ((canvas_width as f64 / src_ratio).round() as u32).clamp(1, canvas_height);
            Self {
                x: 0,
                y: (canvas_height - height) / 2,
                width: canvas_width,
                height,
            }
        } else {
            let width = ((canvas_height as f64 * src_ratio).round() as u32).clamp(1, canvas_width);
            Self {
                x: (canvas_width - width) / 2,
                y: 0,
                width,
                height: canvas_height,
            }
        }
    }
}

/// Letterboxes or pillarboxes `source` onto a black canvas of exactly
/// `canvas_width × canvas_height`.
///
/// The source is scaled uniformly and never cropped. RGBA input is
/// flattened over black. Output is always 3-channel RGB and keeps the
/// source frame index.
///
/// # Panics
/// If the source or the canvas has a zero dimension, or the source is not
/// RGB/RGBA.
pub fn compose(source: &Frame, canvas_width: u32, canvas_height: u32) -> Frame {
    assert!(
        !source.is_empty(),
        "source frame must have non-zero dimensions"
    );
    assert!(
        canvas_width > 0 && canvas_height > 0,
        "canvas must have non-zero dimensions"
    );

    let placement = Placement::fit(source.width(), source.height(), canvas_width, canvas_height);
    let rgb = to_rgb_image(source);
    let scaled = if placement.width == source.width() && placement.height == source.height() {
        rgb
    } else {
        imageops::resize(&rgb, placement.width, placement.height, FilterType::Triangle)
    };
    let scaled = Frame::new(
        scaled.into_raw(),
        placement.width,
        placement.height,
        3,
        source.index(),
    );

    let mut canvas = Frame::black(canvas_width, canvas_height, source.index());
    let (x, y) = (placement.x as usize, placement.y as usize);
    let (w, h) = (placement.width as usize, placement.height as usize);
    canvas
        .as_ndarray_mut()
        .slice_mut(s![y..y + h, x..x + w, ..])
        .assign(&scaled.as_ndarray());
    canvas
}

fn to_rgb_image(frame: &Frame) -> RgbImage {
    let data = match frame.channels() {
        3 => frame.data().to_vec(),
        4 => frame
            .data()
            .chunks_exact(4)
            .flat_map(|px| {
                let a = px[3] as u16;
                [0, 1, 2].map(|c| ((px[c] as u16 * a + 127) / 255) as u8)
            })
            .collect(),
        n => panic!("unsupported channel count {n}; expected RGB or RGBA"),
    };
    RgbImage::from_raw(frame.width(), frame.height(), data)
        .expect("Frame data length must match dimensions")
}
