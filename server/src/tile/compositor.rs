//! Stacks an ordered list of layer images into one composite, reconciling
//! size differences, and encodes the result to bytes in a chosen format.

use std::io::Cursor;

use image::{imageops, DynamicImage, ImageFormat};
use thiserror::Error;

use super::types::ImageFileType;

#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("cannot compose zero layers")]
    NoLayers,
    #[error("encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Left-folds `layers[0]` (the base) with every subsequent overlay,
/// resizing the larger of the two images down to the smaller's
/// dimensions before alpha-compositing, to avoid upscaling artefacts.
pub fn compose(layers: Vec<DynamicImage>) -> Result<DynamicImage, CompositorError> {
    let mut iter = layers.into_iter();
    let mut base = iter.next().ok_or(CompositorError::NoLayers)?;

    for overlay in iter {
        base = composite_pair(base, overlay);
    }

    Ok(base)
}

fn composite_pair(base: DynamicImage, overlay: DynamicImage) -> DynamicImage {
    let (bw, bh) = (base.width(), base.height());
    let (ow, oh) = (overlay.width(), overlay.height());

    // Reconcile by width only, matching buildCompositeImage: a pair with
    // equal widths but different heights is left un-resized.
    let (base, overlay) = if bw == ow {
        (base, overlay)
    } else if bw > ow {
        // Base is wider: shrink it down to the overlay's size.
        (base.resize_exact(ow, oh, imageops::FilterType::Lanczos3), overlay)
    } else {
        // Overlay is wider: shrink it down to the base's size.
        (base, overlay.resize_exact(bw, bh, imageops::FilterType::Lanczos3))
    };

    let mut base_rgba = base.to_rgba8();
    let overlay_rgba = overlay.to_rgba8();
    imageops::overlay(&mut base_rgba, &overlay_rgba, 0, 0);
    DynamicImage::ImageRgba8(base_rgba)
}

/// Encode `image` to bytes. `Auto` keeps PNG, since every composite is
/// normalised to RGBA internally; otherwise the named format is forced.
pub fn encode(image: &DynamicImage, filetype: ImageFileType) -> Result<(Vec<u8>, &'static str), CompositorError> {
    let format = match filetype {
        ImageFileType::Png | ImageFileType::Auto => ImageFormat::Png,
        ImageFileType::Jpeg => ImageFormat::Jpeg,
    };

    let mut buf = Cursor::new(Vec::new());
    if format == ImageFormat::Jpeg {
        // JPEG has no alpha channel.
        image.to_rgb8().write_to(&mut buf, format)?;
    } else {
        image.write_to(&mut buf, format)?;
    }

    let content_type = match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpeg",
        _ => "png",
    };

    Ok((buf.into_inner(), content_type))
}
