use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Platform minimum for a non-final multipart part.
pub const MIN_PART_BYTES: u64 = 5 * 1024 * 1024;
/// Hard cap on parts per upload.
pub const MAX_PARTS: u64 = 10_000;
pub const DEFAULT_PART_BYTES: u64 = 16 * 1024 * 1024;

const SNIFF_BYTES: usize = 1024;

/// Per-file part layout. Parts are uniform except the final one, which may
/// be shorter. A zero-byte file has no parts and skips the chunk phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub part_size: u64,
    pub part_count: u64,
}

/// Compute the part layout for a file. The size is clamped up first, from
/// the requested size, the platform minimum, and `ceil(file_size /
/// MAX_PARTS)`; only then is the count derived, so the part cap holds even
/// for very large files (at the cost of larger-than-requested parts).
pub fn plan_parts(file_size: u64, requested_part_bytes: u64) -> ChunkPlan {
    let floor_for_cap = file_size.div_ceil(MAX_PARTS);
    let part_size = requested_part_bytes.max(MIN_PART_BYTES).max(floor_for_cap);
    let part_count = file_size.div_ceil(part_size).min(MAX_PARTS);
    ChunkPlan {
        part_size,
        part_count,
    }
}

impl ChunkPlan {
    /// Byte range of part `index` (0-based) in a file of `file_size` bytes.
    pub fn part_range(&self, index: u64, file_size: u64) -> (u64, u64) {
        let offset = index * self.part_size;
        let len = self.part_size.min(file_size - offset);
        (offset, len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    Text,
    Binary,
}

/// Classify the first KiB of a file: valid UTF-8 is text, anything else is
/// binary. A short or empty file classifies on whatever bytes it has.
pub fn sniff_bytes(head: &[u8]) -> Sniffed {
    match std::str::from_utf8(head) {
        Ok(_) => Sniffed::Text,
        // A multi-byte sequence cut off at the probe boundary is still text.
        Err(e) if e.valid_up_to() + 4 > head.len() && e.error_len().is_none() => Sniffed::Text,
        Err(_) => Sniffed::Binary,
    }
}

/// Content type for an upload: extension first, then a UTF-8 probe of the
/// first KiB.
pub fn sniff_content_type(path: &Path) -> std::io::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    if let Some(ext) = ext
        && let Some(known) = content_type_for_extension(&ext)
    {
        return Ok(known);
    }

    let mut head = [0u8; SNIFF_BYTES];
    let mut file = File::open(path)?;
    let mut filled = 0;
    loop {
        let n = file.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == head.len() {
            break;
        }
    }

    Ok(match sniff_bytes(&head[..filled]) {
        Sniffed::Text => "text/plain",
        Sniffed::Binary => "application/octet-stream",
    })
}

fn content_type_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "txt" | "text" | "fasta" | "fa" | "fastq" | "fq" | "sam" | "vcf" | "bed" | "gff"
        | "gtf" => "text/plain",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "gz" | "bgz" => "application/gzip",
        "zip" => "application/zip",
        "bam" | "cram" | "bin" => "application/octet-stream",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_plan_invariants(file_size: u64, requested: u64) {
        let plan = plan_parts(file_size, requested);
        assert!(plan.part_count <= MAX_PARTS);
        assert!(plan.part_size >= MIN_PART_BYTES);
        if file_size > 0 {
            assert!((plan.part_count - 1) * plan.part_size < file_size);
            assert!(file_size <= plan.part_count * plan.part_size);
        } else {
            assert_eq!(plan.part_count, 0);
        }
    }

    #[test]
    fn plan_holds_invariants_across_sizes() {
        let sizes = [
            0,
            1,
            MIN_PART_BYTES - 1,
            MIN_PART_BYTES,
            MIN_PART_BYTES + 1,
            100 * 1024 * 1024,
            5 * 1024 * 1024 * 1024,
            MAX_PARTS * MIN_PART_BYTES + 1,
            3 * 1024 * 1024 * 1024 * 1024,
        ];
        let requests = [0, 1, MIN_PART_BYTES, DEFAULT_PART_BYTES, 256 * 1024 * 1024];
        for size in sizes {
            for req in requests {
                assert_plan_invariants(size, req);
            }
        }
    }

    #[test]
    fn five_gib_at_sixteen_mib_gives_320_parts() {
        let plan = plan_parts(5 * 1024 * 1024 * 1024, 16 * 1024 * 1024);
        assert_eq!(plan.part_count, 320);
        assert_eq!(plan.part_size, 16 * 1024 * 1024);
    }

    #[test]
    fn part_cap_inflates_part_size() {
        let size = MAX_PARTS * MIN_PART_BYTES * 3;
        let plan = plan_parts(size, MIN_PART_BYTES);
        assert!(plan.part_size > MIN_PART_BYTES);
        assert!(plan.part_count <= MAX_PARTS);
    }

    #[test]
    fn zero_byte_file_has_no_parts() {
        assert_eq!(plan_parts(0, DEFAULT_PART_BYTES).part_count, 0);
    }

    #[test]
    fn part_range_covers_file_exactly() {
        let size = 2 * MIN_PART_BYTES + 17;
        let plan = plan_parts(size, MIN_PART_BYTES);
        assert_eq!(plan.part_count, 3);
        assert_eq!(plan.part_range(0, size), (0, MIN_PART_BYTES));
        assert_eq!(plan.part_range(1, size), (MIN_PART_BYTES, MIN_PART_BYTES));
        assert_eq!(plan.part_range(2, size), (2 * MIN_PART_BYTES, 17));
    }

    #[test]
    fn sniff_classifies_text_and_binary() {
        assert_eq!(sniff_bytes(b"hello, reads\n"), Sniffed::Text);
        assert_eq!(sniff_bytes(&[0u8, 159, 146, 150]), Sniffed::Binary);
        assert_eq!(sniff_bytes(b""), Sniffed::Text);
    }

    #[test]
    fn sniff_tolerates_truncated_utf8_at_probe_boundary() {
        // "é" = 0xC3 0xA9; cut after the lead byte.
        let mut buf = vec![b'a'; 10];
        buf.push(0xC3);
        assert_eq!(sniff_bytes(&buf), Sniffed::Text);
    }

    #[test]
    fn extension_wins_over_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        std::fs::write(&path, [0u8, 1, 2, 3]).unwrap();
        assert_eq!(sniff_content_type(&path).unwrap(), "text/csv");

        let unknown = dir.path().join("notes.xyz");
        std::fs::write(&unknown, "plain words").unwrap();
        assert_eq!(sniff_content_type(&unknown).unwrap(), "text/plain");
    }
}
