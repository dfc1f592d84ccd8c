//! Content encodings for rendered markup and Accept-Encoding negotiation

use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::body::Bytes;
use std::io::Write;
use tracing::warn;

/// Brotli quality used for rendered pages (max; pages are encoded once)
const BROTLI_QUALITY: u32 = 11;
/// Brotli window size (log2)
const BROTLI_LG_WINDOW: u32 = 22;
const BROTLI_BUFFER_SIZE: usize = 4096;

/// Encodings every render produces, in server preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Brotli,
    Gzip,
    Identity,
}

impl Encoding {
    pub const PREFERENCE: [Encoding; 3] = [Encoding::Brotli, Encoding::Gzip, Encoding::Identity];

    /// Value for the Content-Encoding header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            Encoding::Brotli => "br",
            Encoding::Gzip => "gzip",
            Encoding::Identity => "identity",
        }
    }

    fn token(&self) -> &'static str {
        self.as_header_value()
    }
}

/// Codings offered in an Accept-Encoding header with their q-values
fn parse_accept(header: &str) -> Vec<(String, f32)> {
    let mut offered = Vec::new();
    for part in header.split(',') {
        let mut pieces = part.split(';');
        let coding = pieces.next().unwrap_or("").trim().to_ascii_lowercase();
        if coding.is_empty() {
            continue;
        }
        let q = pieces
            .filter_map(|p| p.trim().strip_prefix("q="))
            .filter_map(|v| v.trim().parse::<f32>().ok())
            .next()
            .unwrap_or(1.0);
        offered.push((coding, q));
    }
    offered
}

fn quality(offered: &[(String, f32)], encoding: Encoding) -> f32 {
    let explicit = offered.iter().find(|(c, _)| c == encoding.token());
    let wildcard = offered.iter().find(|(c, _)| c == "*");
    match (explicit, wildcard, encoding) {
        (Some((_, q)), _, _) => *q,
        (None, Some((_, q)), _) => *q,
        (None, None, Encoding::Identity) => 1.0,
        (None, None, _) => 0.0,
    }
}

/// Pick the response encoding from an Accept-Encoding header.
///
/// Highest q-value wins; ties go to brotli, then gzip, then identity.
/// Identity is implicitly acceptable, and is also the answer when nothing is.
pub fn negotiate(accept_encoding: Option<&str>) -> Encoding {
    let offered = match accept_encoding {
        Some(h) if !h.trim().is_empty() => parse_accept(h),
        _ => return Encoding::Identity,
    };

    let mut best = Encoding::Identity;
    let mut best_q = 0.0f32;
    for encoding in Encoding::PREFERENCE {
        let q = quality(&offered, encoding);
        if q > best_q {
            best = encoding;
            best_q = q;
        }
    }
    best
}

/// Whether the client accepts `encoding` at all
pub fn accepts(accept_encoding: Option<&str>, encoding: Encoding) -> bool {
    match accept_encoding {
        Some(h) => quality(&parse_accept(h), encoding) > 0.0,
        None => encoding == Encoding::Identity,
    }
}

/// All byte variants of one rendered document.
///
/// Identity is always present; a compressed variant is `None` when its codec failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedVariants {
    pub identity: Bytes,
    pub gzip: Option<Bytes>,
    pub brotli: Option<Bytes>,
}

impl EncodedVariants {
    pub fn get(&self, encoding: Encoding) -> Option<&Bytes> {
        match encoding {
            Encoding::Identity => Some(&self.identity),
            Encoding::Gzip => self.gzip.as_ref(),
            Encoding::Brotli => self.brotli.as_ref(),
        }
    }
}

pub fn gzip(input: &[u8], level: Compression) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(input.len() / 2), level);
    encoder.write_all(input)?;
    encoder.finish()
}

pub fn brotli(input: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut output = Vec::with_capacity(input.len() / 2);
    {
        let mut writer = brotli::CompressorWriter::new(
            &mut output,
            BROTLI_BUFFER_SIZE,
            BROTLI_QUALITY,
            BROTLI_LG_WINDOW,
        );
        writer.write_all(input)?;
        writer.flush()?;
    }
    Ok(output)
}

/// Encode markup into every variant.
///
/// Gzip and brotli run as independent blocking tasks and are joined before
/// returning, so the caller can store all variants in one step.
pub async fn encode_all(markup: String) -> EncodedVariants {
    let identity = Bytes::from(markup);

    let gzip_input = identity.clone();
    let gzip_task =
        tokio::task::spawn_blocking(move || gzip(&gzip_input, Compression::default()));
    let brotli_input = identity.clone();
    let brotli_task = tokio::task::spawn_blocking(move || brotli(&brotli_input));

    let (gzip_result, brotli_result) = tokio::join!(gzip_task, brotli_task);

    EncodedVariants {
        gzip: settle("gzip", gzip_result),
        brotli: settle("br", brotli_result),
        identity,
    }
}

fn settle(
    codec: &'static str,
    result: Result<std::io::Result<Vec<u8>>, tokio::task::JoinError>,
) -> Option<Bytes> {
    match result {
        Ok(Ok(bytes)) => Some(Bytes::from(bytes)),
        Ok(Err(e)) => {
            warn!(codec, error = %e, "Encoding failed, variant will be missing");
            None
        }
        Err(e) => {
            warn!(codec, error = %e, "Encoding task failed, variant will be missing");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_negotiate_prefers_brotli_then_gzip() {
        assert_eq!(negotiate(Some("gzip, deflate, br")), Encoding::Brotli);
        assert_eq!(negotiate(Some("gzip, deflate")), Encoding::Gzip);
        assert_eq!(negotiate(Some("deflate")), Encoding::Identity);
    }

    #[test]
    fn test_negotiate_without_header_is_identity() {
        assert_eq!(negotiate(None), Encoding::Identity);
        assert_eq!(negotiate(Some("")), Encoding::Identity);
    }

    #[test]
    fn test_negotiate_respects_q_values() {
        assert_eq!(negotiate(Some("br;q=0.5, gzip;q=0.8")), Encoding::Gzip);
        assert_eq!(negotiate(Some("br;q=0, gzip")), Encoding::Gzip);
        assert_eq!(negotiate(Some("br;q=0, gzip;q=0")), Encoding::Identity);
        assert_eq!(negotiate(Some("identity;q=0.1, gzip;q=0.05")), Encoding::Identity);
    }

    #[test]
    fn test_accepts() {
        assert!(accepts(Some("gzip, br"), Encoding::Gzip));
        assert!(!accepts(Some("br"), Encoding::Gzip));
        assert!(!accepts(Some("gzip;q=0"), Encoding::Gzip));
        assert!(accepts(Some("*;q=0.1"), Encoding::Gzip));
        assert!(!accepts(None, Encoding::Gzip));
    }

    #[test]
    fn test_negotiate_wildcard() {
        assert_eq!(negotiate(Some("*")), Encoding::Brotli);
        assert_eq!(negotiate(Some("br;q=0, *;q=0.5")), Encoding::Gzip);
    }

    #[tokio::test]
    async fn test_compressed_variants_decode_to_identity() {
        let markup = "<html><body>".to_string() + &"<p>hello</p>".repeat(200) + "</body></html>";
        let variants = encode_all(markup.clone()).await;

        assert_eq!(&variants.identity[..], markup.as_bytes());

        let mut gunzipped = Vec::new();
        GzDecoder::new(&variants.gzip.as_ref().unwrap()[..])
            .read_to_end(&mut gunzipped)
            .unwrap();
        assert_eq!(gunzipped, markup.as_bytes());

        let mut unbrotlied = Vec::new();
        brotli::Decompressor::new(&variants.brotli.as_ref().unwrap()[..], 4096)
            .read_to_end(&mut unbrotlied)
            .unwrap();
        assert_eq!(unbrotlied, markup.as_bytes());
    }

    #[test]
    fn test_missing_variant_lookup() {
        let variants = EncodedVariants {
            identity: Bytes::from_static(b"<html></html>"),
            gzip: None,
            brotli: Some(Bytes::from_static(b"x")),
        };
        assert!(variants.get(Encoding::Gzip).is_none());
        assert!(variants.get(Encoding::Brotli).is_some());
        assert_eq!(variants.get(Encoding::Identity).unwrap(), &variants.identity);
    }
}
