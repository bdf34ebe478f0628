//! Transparent input opening.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use flate2::bufread::MultiGzDecoder;

/// Open a trace file for reading, decompressing gzip input transparently.
///
/// Detection is by magic bytes rather than file extension, so renamed logs
/// and process-substitution paths keep working.
pub fn open_stream(path: &Path) -> io::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let is_gzip = {
        let head = reader.fill_buf()?;
        head.len() >= 2 && head[0] == 0x1f && head[1] == 0x8b
    };
    if is_gzip {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}
