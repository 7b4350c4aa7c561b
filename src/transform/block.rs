use super::PacketTransformer;
use crate::packet::{Packet, RequestPacket, ResponsePacket};

/// Blocks every request and serves a canned page instead: `incoming` clears
/// the forward flag so the worker skips the upstream fetch, `outgoing`
/// rewrites the placeholder into a 200 with the fixed HTML body.
pub struct BlockServeTransformer {
    html: String,
}

impl BlockServeTransformer {
    pub fn new(content: &str) -> Self {
        let html = format!(
            "<?xml version=\"1.0\" encoding=\"iso-8859-1\"?>\n\
             <!DOCTYPE html>\n\
             <html lang=\"en\">\n\
             \x20 <head>\n\
             \x20   <title>Hacked</title>\n\
             \x20 </head>\n\
             \x20 <body>\n\
             \x20   <p>{content}</p>\n\
             \x20 </body>\n\
             </html>\n"
        );
        Self { html }
    }
}

impl PacketTransformer for BlockServeTransformer {
    fn incoming(&self, req: &mut RequestPacket) {
        req.should_forward = false;
    }

    fn outgoing(&self, res: &mut ResponsePacket) {
        res.code = 200;
        res.status = "OK".to_string();
        res.set_content(self.html.clone().into_bytes());
        res.headers.remove(b"Content-Encoding");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::find_subslice;

    #[test]
    fn test_forward_flag_cleared() {
        let transformer = BlockServeTransformer::new("blocked");
        let mut req = RequestPacket::parse_head(b"GET http://a.test/ HTTP/1.1\r\nHost: a.test")
            .unwrap();
        transformer.incoming(&mut req);
        assert!(!req.should_forward);
    }

    #[test]
    fn test_outgoing_rewrites_to_canned_page() {
        let transformer = BlockServeTransformer::new("You are being attacked");
        let mut res = ResponsePacket::error_page(418, "I'm a teapot");
        res.headers.insert("Content-Encoding", "gzip");

        transformer.outgoing(&mut res);

        assert_eq!(res.code, 200);
        assert_eq!(res.status, "OK");
        assert!(!res.headers.contains(b"Content-Encoding"));
        assert!(find_subslice(&res.body, b"<p>You are being attacked</p>").is_some());
        assert_eq!(
            res.headers.get(b"Content-Length"),
            Some(res.body.len().to_string().as_bytes())
        );
    }
}
