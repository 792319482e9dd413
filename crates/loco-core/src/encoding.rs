use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionSource {
    ByteOrderMark,
    Heuristic,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedEncoding {
    pub encoding: &'static Encoding,
    pub source: DetectionSource,
}

impl DetectedEncoding {
    pub fn label(&self) -> &'static str {
        self.encoding.name()
    }
}

/// Guesses the text encoding of a log from a bounded sample of its leading bytes.
///
/// A byte order mark wins outright. Otherwise the statistical detector is
/// consulted and its guess is only taken when it beat at least one competing
/// candidate; a low-confidence guess yields `fallback` instead. `complete` tells
/// the detector whether `sample` is the whole file, so a multi-byte sequence cut
/// by the sample boundary is not held against UTF-8.
pub fn detect_encoding(
    sample: &[u8],
    complete: bool,
    fallback: &'static Encoding,
) -> DetectedEncoding {
    if let Some((encoding, _)) = Encoding::for_bom(sample) {
        return DetectedEncoding {
            encoding,
            source: DetectionSource::ByteOrderMark,
        };
    }

    if sample.is_ascii() {
        return DetectedEncoding {
            encoding: fallback,
            source: DetectionSource::Fallback,
        };
    }

    if is_utf8_sample(sample, complete) {
        return DetectedEncoding {
            encoding: UTF_8,
            source: DetectionSource::Heuristic,
        };
    }

    let mut detector = EncodingDetector::new();
    detector.feed(sample, complete);
    let (encoding, confident) = detector.guess_assess(None, true);
    if confident {
        DetectedEncoding {
            encoding,
            source: DetectionSource::Heuristic,
        }
    } else {
        DetectedEncoding {
            encoding: fallback,
            source: DetectionSource::Fallback,
        }
    }
}

fn is_utf8_sample(sample: &[u8], complete: bool) -> bool {
    match std::str::from_utf8(sample) {
        Ok(_) => true,
        // error_len() == None means the sample ends inside a multi-byte sequence.
        Err(err) => !complete && err.error_len().is_none(),
    }
}

/// Decodes the full file with the detected encoding. Malformed sequences become
/// U+FFFD rather than failing the file.
pub fn decode(bytes: &[u8], encoding: &'static Encoding) -> String {
    let (text, _had_errors) = encoding.decode_with_bom_removal(bytes);
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{UTF_16LE, UTF_8, WINDOWS_1252};

    #[test]
    fn bom_is_authoritative() {
        let detected = detect_encoding(b"\xFF\xFEV\x00a\x00", true, UTF_8);
        assert_eq!(detected.encoding, UTF_16LE);
        assert_eq!(detected.source, DetectionSource::ByteOrderMark);
    }

    #[test]
    fn ascii_sample_falls_back_to_default() {
        let detected = detect_encoding(b"\"VarName\";\"VarValue\"\n", true, UTF_8);
        assert_eq!(detected.encoding, UTF_8);
        assert_eq!(detected.source, DetectionSource::Fallback);
    }

    #[test]
    fn utf8_text_decodes_to_same_string() {
        let text = "\"VarName\";\"VarValue\"\n\"PRESIÓN ACEITE\";\"10500,5\"\n";
        let detected = detect_encoding(text.as_bytes(), true, WINDOWS_1252);
        assert_eq!(decode(text.as_bytes(), detected.encoding), text);
    }

    #[test]
    fn utf8_sample_cut_mid_character_still_detects_utf8() {
        let bytes = "PRESIÓN".as_bytes();
        let detected = detect_encoding(&bytes[..6], false, WINDOWS_1252);
        assert_eq!(detected.encoding, UTF_8);
        assert_eq!(detected.source, DetectionSource::Heuristic);
    }

    #[test]
    fn latin1_text_is_not_mangled_into_replacement_chars() {
        let mut bytes = b"\"VarName\";\"VarValue\"\n".to_vec();
        for _ in 0..40 {
            bytes.extend_from_slice(b"\"PRESI\xd3N ACEITE COMPRESOR\";\"10500,5\"\n");
            bytes.extend_from_slice(b"\"TEMPERATURA M\xc1XIMA\";\"65,0\"\n");
        }
        let detected = detect_encoding(&bytes, true, UTF_8);
        let text = decode(&bytes, detected.encoding);
        assert!(!text.contains('\u{FFFD}'));
        assert!(text.contains("PRESIÓN ACEITE"));
    }
}
