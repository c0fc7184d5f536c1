//! Mapping between MIME types and CoAP Content-Format numbers, see the
//! [IANA registry](https://www.iana.org/assignments/core-parameters/core-parameters.xhtml#content-formats).

const REGISTRY: &[(&str, u16)] = &[
    ("text/plain", 0),
    ("application/cose; cose-type=\"cose-encrypt0\"", 16),
    ("application/cose; cose-type=\"cose-mac0\"", 17),
    ("application/cose; cose-type=\"cose-sign1\"", 18),
    ("application/link-format", 40),
    ("application/xml", 41),
    ("application/octet-stream", 42),
    ("application/exi", 47),
    ("application/json", 50),
    ("application/json-patch+json", 51),
    ("application/merge-patch+json", 52),
    ("application/cbor", 60),
    ("application/cwt", 61),
    ("application/senml+json", 110),
    ("application/sensml+json", 111),
    ("application/senml+cbor", 112),
    ("application/sensml+cbor", 113),
    ("application/senml-exi", 114),
    ("application/sensml-exi", 115),
    ("application/senml+xml", 310),
    ("application/sensml+xml", 311),
    ("application/vnd.oma.lwm2m+tlv", 11542),
    ("application/vnd.oma.lwm2m+json", 11543),
];

/// Content-Format for a MIME type.  Parameters such as `; charset=utf-8` are ignored unless the
/// registry lists the parameterized form explicitly.
pub fn content_format_for(mime_type: &str) -> Option<u16> {
    let normalized = mime_type.trim().to_ascii_lowercase();
    lookup(&normalized).or_else(|| {
        let essence = normalized.split(';').next()?.trim();
        lookup(essence)
    })
}

pub fn mime_type_for(content_format: u16) -> Option<&'static str> {
    REGISTRY
        .iter()
        .find(|(_, number)| *number == content_format)
        .map(|(mime, _)| *mime)
}

fn lookup(mime_type: &str) -> Option<u16> {
    REGISTRY
        .iter()
        .find(|(mime, _)| *mime == mime_type)
        .map(|(_, number)| *number)
}
