use std::io::Read;

use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http_body_util::{combinators, BodyExt, Empty, Full};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type BoxBody = combinators::BoxBody<Bytes, BoxError>;

pub fn full(bytes: impl Into<Bytes>) -> BoxBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> BoxBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Box any body whose error converts into [`BoxError`].
pub fn boxed<B>(body: B) -> BoxBody
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed()
}

/// Undo a `Content-Encoding`. Returns `None` for encodings we cannot decode
/// or bodies that fail to decode, in which case the caller passes the
/// original bytes through.
pub fn decode(encoding: Option<&str>, bytes: &Bytes) -> Option<Bytes> {
    let encoding = encoding.map(|e| e.trim().to_ascii_lowercase());
    match encoding.as_deref() {
        None | Some("") | Some("identity") => Some(bytes.clone()),
        Some("gzip") | Some("x-gzip") => read_all(GzDecoder::new(&bytes[..])),
        // Servers disagree on whether "deflate" means zlib-wrapped or raw
        Some("deflate") => read_all(ZlibDecoder::new(&bytes[..]))
            .or_else(|| read_all(DeflateDecoder::new(&bytes[..]))),
        Some(other) => {
            tracing::debug!("Unsupported content encoding '{}', passing through", other);
            None
        }
    }
}

fn read_all(mut reader: impl Read) -> Option<Bytes> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).ok()?;
    Some(Bytes::from(out))
}
