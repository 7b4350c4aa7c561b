mod block;
mod image;

pub use block::BlockServeTransformer;
pub use image::ImageSwapTransformer;

use crate::packet::{RequestPacket, ResponsePacket};

pub const REPLACEMENT_IMAGE_URL: &str = "http://ocna0.d2.comp.nus.edu.sg:50000/change.jpg";
pub const BLOCK_PAGE_TEXT: &str = "You are being attacked";

/// Installable rewrite hook. `incoming` runs on parsed requests before the
/// upstream fetch, `outgoing` on responses before they are returned to the
/// client; both default to pass-through. A transformer that mutates a body
/// must go through `set_content` so the framing headers stay truthful.
pub trait PacketTransformer: Send + Sync {
    fn incoming(&self, _req: &mut RequestPacket) {}

    fn outgoing(&self, _res: &mut ResponsePacket) {}
}

/// Builds the pipeline selected on the command line, in install order.
pub fn install(image: bool, attack: bool) -> Vec<Box<dyn PacketTransformer>> {
    let mut pipeline: Vec<Box<dyn PacketTransformer>> = Vec::new();
    if image {
        pipeline.push(Box::new(ImageSwapTransformer::new(REPLACEMENT_IMAGE_URL)));
    }
    if attack {
        pipeline.push(Box::new(BlockServeTransformer::new(BLOCK_PAGE_TEXT)));
    }
    pipeline
}
