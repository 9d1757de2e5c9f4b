//! Short-string compression for envelopes.
//!
//! LoRa airtime is the scarcest resource on the node, and envelopes are
//! short text records, so general-purpose compressors do worse than a
//! static dictionary. This is the smaz2 scheme: common English bigrams and
//! whole words become single codes, printable ASCII passes through, and
//! everything else is escaped verbatim. The tables below are smaz2's, so
//! streams interoperate with nodes running the C implementation.
//!
//! Code space of the compressed stream:
//!
//! ```text
//!   0x00        invalid
//!   0x01..0x05  next 1..5 bytes are verbatim
//!   0x06 <i>    WORDS[i] followed by a space
//!   0x07 <i>    a space followed by WORDS[i]
//!   0x08 <i>    WORDS[i]
//!   0x09..0x7f  literal byte
//!   0x80..0xff  bigram (code - 0x80) of BIGRAMS
//! ```
//!
//! The compressed blob on the wire is prefixed with the original length as a
//! 4-byte big-endian header (`compress_with_header`).

const VERBATIM_MAX: usize = 5;
const WORD_SPACE_AFTER: u8 = 0x06;
const WORD_SPACE_BEFORE: u8 = 0x07;
const WORD_PLAIN: u8 = 0x08;
const LITERAL_MIN: u8 = 0x09;
const BIGRAM_BASE: u8 = 0x80;

/// Length of the original-size header.
pub const HEADER_LEN: usize = 4;

/// Upper bound on the original size a header may declare.
pub const MAX_DECOMPRESSED_LEN: usize = 64 * 1024;

/// Bigram table: 128 pairs packed back to back. Pair `i` is emitted as
/// `0x80 + i`.
const BIGRAMS: &[u8; 256] = b"\
    intherreheanonesorteattistenntartondalitseediseangoulecomeneriro\
    deraioicliofasetvetasihamaecomceelllcaurlachhidihofonsotacnarsso\
    prrtsassusnoiltsemctgeloeebetrnipeiepancpooldaadviunamutwimoshyo\
    aiewowosfiepttmiopiaweagsuiddoooirspplscaywaigeirylytuulivimabty";

/// Word table, emitted after a word code. Every entry is four or more bytes.
const WORDS: [&str; 256] = [
    "that", "this", "with", "from", "your", "have", "more", "will", "home", "about", "page",
    "search", "free", "other", "information", "time", "they", "site", "what", "which", "their",
    "news", "there", "only", "when", "contact", "here", "business", "also", "help", "view",
    "online", "first", "been", "would", "were", "services", "some", "these", "click", "like",
    "service", "than", "find", "price", "date", "back", "people", "list", "name", "just",
    "over", "state", "year", "into", "email", "health", "world", "next", "used", "work", "last",
    "most", "products", "music", "data", "make", "them", "should", "product", "system", "post",
    "city", "policy", "number", "such", "please", "available", "copyright", "support",
    "message", "after", "best", "software", "then", "good", "video", "well", "where", "info",
    "rights", "public", "books", "high", "school", "through", "each", "links", "review",
    "years", "order", "very", "privacy", "book", "items", "company", "read", "group", "need",
    "many", "user", "said", "does", "under", "general", "research", "university", "january",
    "mail", "full", "reviews", "program", "life", "know", "games", "days", "management", "part",
    "could", "great", "united", "hotel", "real", "item", "international", "center", "ebay",
    "must", "store", "travel", "comments", "made", "development", "report", "member", "details",
    "line", "terms", "before", "hotels", "send", "right", "type", "because", "local", "those",
    "using", "results", "office", "education", "national", "design", "take", "posted",
    "internet", "address", "community", "within", "states", "area", "want", "phone", "shipping",
    "reserved", "subject", "between", "forum", "family", "long", "based", "code", "show",
    "even", "black", "check", "special", "prices", "website", "index", "being", "women", "much",
    "sign", "file", "link", "open", "today", "technology", "south", "case", "project", "same",
    "pages", "version", "section", "found", "sports", "house", "related", "security", "both",
    "county", "american", "photo", "game", "members", "power", "while", "care", "network",
    "down", "computer", "systems", "three", "total", "place", "following", "download",
    "without", "access", "think", "north", "resources", "current", "posts", "media", "control",
    "water", "history", "pictures", "size", "personal", "since", "including", "guide", "shop",
    "directory", "board", "location", "change", "white", "text", "small", "rating", "rate",
    "government",
];

fn word_at(index: u8) -> &'static [u8] {
    WORDS[index as usize].as_bytes()
}

fn bigram_at(code: u8) -> &'static [u8] {
    let i = (code - BIGRAM_BASE) as usize * 2;
    &BIGRAMS[i..i + 2]
}

/// Longest dictionary word that `input` starts with.
fn match_word(input: &[u8]) -> Option<(u8, usize)> {
    let mut best: Option<(u8, usize)> = None;
    for (i, word) in WORDS.iter().enumerate() {
        let w = word.as_bytes();
        if input.starts_with(w) && best.map_or(true, |(_, len)| w.len() > len) {
            best = Some((i as u8, w.len()));
        }
    }
    best
}

fn match_bigram(a: u8, b: u8) -> Option<u8> {
    BIGRAMS
        .chunks_exact(2)
        .position(|bg| bg[0] == a && bg[1] == b)
        .map(|i| BIGRAM_BASE + i as u8)
}

fn flush_verbatim(out: &mut Vec<u8>, pending: &mut Vec<u8>) {
    if !pending.is_empty() {
        out.push(pending.len() as u8);
        out.append(pending);
    }
}

/// Compress a byte string. Fails on empty input: the compressor never
/// produces an empty stream, and callers treat that as a hard failure.
pub fn compress(input: &[u8]) -> Result<Vec<u8>, CompressError> {
    if input.is_empty() {
        return Err(CompressError::Empty);
    }
    let limit = input.len() * 2;
    let mut out = Vec::with_capacity(input.len());
    let mut pending = Vec::with_capacity(VERBATIM_MAX);
    let mut i = 0;

    while i < input.len() {
        let rest = &input[i..];

        if rest[0] == b' ' {
            if let Some((idx, len)) = match_word(&rest[1..]) {
                flush_verbatim(&mut out, &mut pending);
                out.extend_from_slice(&[WORD_SPACE_BEFORE, idx]);
                i += 1 + len;
                continue;
            }
        }

        if let Some((idx, len)) = match_word(rest) {
            flush_verbatim(&mut out, &mut pending);
            if rest.get(len) == Some(&b' ') {
                out.extend_from_slice(&[WORD_SPACE_AFTER, idx]);
                i += len + 1;
            } else {
                out.extend_from_slice(&[WORD_PLAIN, idx]);
                i += len;
            }
            continue;
        }

        if rest.len() >= 2 {
            if let Some(code) = match_bigram(rest[0], rest[1]) {
                flush_verbatim(&mut out, &mut pending);
                out.push(code);
                i += 2;
                continue;
            }
        }

        let b = rest[0];
        if (LITERAL_MIN..BIGRAM_BASE).contains(&b) {
            flush_verbatim(&mut out, &mut pending);
            out.push(b);
        } else {
            pending.push(b);
            if pending.len() == VERBATIM_MAX {
                flush_verbatim(&mut out, &mut pending);
            }
        }
        i += 1;
    }
    flush_verbatim(&mut out, &mut pending);

    if out.len() > limit {
        return Err(CompressError::Overflow(limit));
    }
    Ok(out)
}

/// Decompress a stream produced by `compress`. Output longer than `limit`
/// bytes is an error.
pub fn decompress(input: &[u8], limit: usize) -> Result<Vec<u8>, CompressError> {
    let mut out = Vec::with_capacity(limit.min(input.len() * 4));
    let mut i = 0;

    while i < input.len() {
        let code = input[i];
        i += 1;
        match code {
            0 => return Err(CompressError::InvalidCode(0)),
            1..=5 => {
                let n = code as usize;
                let run = input.get(i..i + n).ok_or(CompressError::Truncated)?;
                out.extend_from_slice(run);
                i += n;
            }
            WORD_SPACE_AFTER | WORD_SPACE_BEFORE | WORD_PLAIN => {
                let idx = *input.get(i).ok_or(CompressError::Truncated)?;
                i += 1;
                let word = word_at(idx);
                if code == WORD_SPACE_BEFORE {
                    out.push(b' ');
                }
                out.extend_from_slice(word);
                if code == WORD_SPACE_AFTER {
                    out.push(b' ');
                }
            }
            LITERAL_MIN..=0x7f => out.push(code),
            _ => out.extend_from_slice(bigram_at(code)),
        }
        if out.len() > limit {
            return Err(CompressError::Overflow(limit));
        }
    }
    Ok(out)
}

/// Compress and prepend the 4-byte big-endian original length.
pub fn compress_with_header(input: &[u8]) -> Result<Vec<u8>, CompressError> {
    if input.len() > MAX_DECOMPRESSED_LEN {
        return Err(CompressError::TooLarge(input.len()));
    }
    let body = compress(input)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&(input.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Read the length header and decompress the body. The output must be
/// non-empty and exactly the declared length.
pub fn decompress_with_header(input: &[u8]) -> Result<Vec<u8>, CompressError> {
    let header: [u8; HEADER_LEN] = input
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(CompressError::Truncated)?;
    let declared = u32::from_be_bytes(header) as usize;
    if declared > MAX_DECOMPRESSED_LEN {
        return Err(CompressError::TooLarge(declared));
    }
    let out = decompress(&input[HEADER_LEN..], declared)?;
    if out.is_empty() {
        return Err(CompressError::Empty);
    }
    if out.len() != declared {
        return Err(CompressError::LengthMismatch {
            declared,
            actual: out.len(),
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompressError {
    #[error("compressor produced no output")]
    Empty,
    #[error("output exceeds {0} bytes")]
    Overflow(usize),
    #[error("input of {0} bytes exceeds the maximum")]
    TooLarge(usize),
    #[error("compressed stream is truncated")]
    Truncated,
    #[error("invalid code 0x{0:02x} in compressed stream")]
    InvalidCode(u8),
    #[error("declared length {declared} but decompressed {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(input: &[u8]) -> Vec<u8> {
        let packed = compress_with_header(input).unwrap();
        decompress_with_header(&packed).unwrap()
    }

    #[test]
    fn tables_fill_code_space() {
        let mut pairs: Vec<&[u8]> = BIGRAMS.chunks_exact(2).collect();
        pairs.sort_unstable();
        pairs.dedup();
        assert_eq!(pairs.len(), 128);
        assert!(WORDS.iter().all(|w| w.len() >= 4));
        assert_eq!(&BIGRAMS[..6], b"inther");
        assert_eq!(WORDS[0], "that");
    }

    #[test]
    fn known_vectors() {
        // "he", "ll", literal 'o'
        assert_eq!(compress(b"hello").unwrap(), [0x84, 0xb1, b'o']);
        // "this " then "message"
        assert_eq!(compress(b"this message").unwrap(), [WORD_SPACE_AFTER, 1, WORD_PLAIN, 80]);
        assert_eq!(decompress(&[0x80, b' ', 0x81, b'e'], 16).unwrap(), b"in the");
        assert_eq!(decompress(&[WORD_SPACE_BEFORE, 0], 16).unwrap(), b" that");
    }

    #[test]
    fn english_text_shrinks() {
        let text = b"the node is going back to base camp, please confirm the position";
        let packed = compress(text).unwrap();
        assert!(packed.len() < text.len(), "{} >= {}", packed.len(), text.len());
        assert_eq!(decompress(&packed, text.len()).unwrap(), text);
    }

    #[test]
    fn envelope_record_round_trips() {
        let record = b"alpha|1760000000|0|hello there | with pipes";
        assert_eq!(round_trip(record), record);
    }

    #[test]
    fn binary_bytes_round_trip() {
        let data: Vec<u8> = (0u8..=255).collect();
        assert_eq!(round_trip(&data), data);
    }

    #[test]
    fn control_bytes_use_verbatim_runs() {
        let data = [0u8, 1, 2, 3, 4, 5, 6, 7, 8];
        let packed = compress(&data).unwrap();
        assert_eq!(packed[0], 5);
        assert_eq!(decompress(&packed, data.len()).unwrap(), data);
    }

    #[test]
    fn utf8_round_trips() {
        let text = "Grüße vom Gipfel ⛰ - alles gut";
        assert_eq!(round_trip(text.as_bytes()), text.as_bytes());
    }

    #[test]
    fn empty_input_is_a_failure() {
        assert_eq!(compress(b"").unwrap_err(), CompressError::Empty);
        assert_eq!(compress_with_header(b"").unwrap_err(), CompressError::Empty);
    }

    #[test]
    fn header_is_big_endian_length() {
        let packed = compress_with_header(b"hello").unwrap();
        assert_eq!(&packed[..4], &[0, 0, 0, 5]);
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut packed = compress_with_header(b"hello world").unwrap();
        packed[3] = 3;
        assert!(decompress_with_header(&packed).is_err());
        packed[3] = 200;
        assert!(matches!(
            decompress_with_header(&packed),
            Err(CompressError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn truncated_streams_rejected() {
        assert_eq!(decompress_with_header(&[0, 0]).unwrap_err(), CompressError::Truncated);
        assert_eq!(decompress(&[3, b'a'], 10).unwrap_err(), CompressError::Truncated);
        assert_eq!(decompress(&[WORD_PLAIN], 10).unwrap_err(), CompressError::Truncated);
    }

    #[test]
    fn invalid_codes_rejected() {
        assert_eq!(decompress(&[0], 10).unwrap_err(), CompressError::InvalidCode(0));
        assert_eq!(decompress(&[b'a', 0], 10).unwrap_err(), CompressError::InvalidCode(0));
    }

    #[test]
    fn oversized_header_rejected() {
        let mut packed = compress_with_header(b"hi").unwrap();
        packed[..4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decompress_with_header(&packed),
            Err(CompressError::TooLarge(_))
        ));
    }
}
