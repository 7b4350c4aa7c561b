use super::PacketTransformer;
use crate::packet::RequestPacket;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpeg", "jpg", "ico", "gif"];

/// Rewrites every image request to a fixed replacement image. The `Host`
/// header follows the URL so host/port resolution targets the replacement
/// origin.
pub struct ImageSwapTransformer {
    url: String,
    host: String,
}

impl ImageSwapTransformer {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let authority = authority_of(&url);
        // Keep an explicit port in the Host value unless it is the scheme
        // default.
        let host = match authority.split_once(':') {
            Some((name, "80")) | Some((name, "443")) => name.to_string(),
            _ => authority.to_string(),
        };
        Self { url, host }
    }
}

impl PacketTransformer for ImageSwapTransformer {
    fn incoming(&self, req: &mut RequestPacket) {
        let extension = req.url.rsplit('.').next().unwrap_or_default();
        if IMAGE_EXTENSIONS.contains(&extension) {
            req.url = self.url.clone();
            req.headers.insert("Host", self.host.as_str());
        }
    }
}

fn authority_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', '?']).next().unwrap_or(rest)
}
