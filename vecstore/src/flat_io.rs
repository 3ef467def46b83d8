use std::io::{BufReader, BufWriter, Read, Write};

use crate::error::VecError;
use crate::flat::FlatIndex;

/// Binary format magic and version.
const FLAT_MAGIC: [u8; 4] = [b'F', b'I', b'D', b'X'];
const FLAT_VERSION: u32 = 1;

/// Snapshot is a decoded index together with the generation it was taken at.
#[derive(Debug)]
pub struct Snapshot {
    pub generation: u64,
    pub index: FlatIndex,
}

/// Save serializes the index to a writer:
///
/// ```text
/// [4B magic "FIDX"] [4B version=1]
/// [4B dim] [8B generation] [4B count]
/// [count x dim x 4B float32 vector]
/// ```
///
/// All multi-byte values are little-endian. `generation` is an opaque
/// counter the owner uses to tell whether the snapshot is current.
pub fn save(idx: &FlatIndex, generation: u64, w: &mut dyn Write) -> Result<(), VecError> {
    let mut bw = BufWriter::new(w);
    let write_err = |e: std::io::Error| VecError::Io(e.to_string());

    // Header.
    bw.write_all(&FLAT_MAGIC).map_err(write_err)?;
    bw.write_all(&FLAT_VERSION.to_le_bytes()).map_err(write_err)?;
    bw.write_all(&(idx.dim() as u32).to_le_bytes()).map_err(write_err)?;
    bw.write_all(&generation.to_le_bytes()).map_err(write_err)?;
    bw.write_all(&(idx.len() as u32).to_le_bytes()).map_err(write_err)?;

    // Vectors, in slot order.
    for &v in idx.raw() {
        bw.write_all(&v.to_le_bytes()).map_err(write_err)?;
    }

    bw.flush().map_err(write_err)?;
    Ok(())
}

/// Load deserializes an index written by [`save`]. Trailing bytes, short
/// reads and non-finite components are all rejected.
pub fn load(r: &mut dyn Read) -> Result<Snapshot, VecError> {
    let mut br = BufReader::new(r);
    let read_err = |e: std::io::Error| VecError::Io(e.to_string());

    let mut buf4 = [0u8; 4];

    // Magic.
    br.read_exact(&mut buf4).map_err(read_err)?;
    if buf4 != FLAT_MAGIC {
        return Err(VecError::InvalidFormat(format!("invalid magic {buf4:?}")));
    }

    // Version.
    br.read_exact(&mut buf4).map_err(read_err)?;
    let version = u32::from_le_bytes(buf4);
    if version != FLAT_VERSION {
        return Err(VecError::InvalidFormat(format!(
            "unsupported version {version} (want {FLAT_VERSION})"
        )));
    }

    br.read_exact(&mut buf4).map_err(read_err)?;
    let dim = u32::from_le_bytes(buf4) as usize;
    if dim == 0 {
        return Err(VecError::InvalidFormat("invalid dimension 0".into()));
    }

    let mut buf8 = [0u8; 8];
    br.read_exact(&mut buf8).map_err(read_err)?;
    let generation = u64::from_le_bytes(buf8);

    br.read_exact(&mut buf4).map_err(read_err)?;
    let count = u32::from_le_bytes(buf4) as usize;

    let total = count
        .checked_mul(dim)
        .ok_or_else(|| VecError::InvalidFormat(format!("count {count} x dim {dim} overflows")))?;

    // Grow as we read instead of trusting the header for the allocation.
    let mut data = Vec::with_capacity(total.min(1 << 20));
    for i in 0..total {
        br.read_exact(&mut buf4).map_err(read_err)?;
        let v = f32::from_le_bytes(buf4);
        if !v.is_finite() {
            return Err(VecError::InvalidFormat(format!(
                "non-finite value in slot {}",
                i / dim
            )));
        }
        data.push(v);
    }

    let mut tail = [0u8; 1];
    if br.read(&mut tail).map_err(read_err)? != 0 {
        return Err(VecError::InvalidFormat("trailing bytes after vectors".into()));
    }

    Ok(Snapshot {
        generation,
        index: FlatIndex::from_raw(dim, data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load() {
        let mut idx = FlatIndex::new(4);
        idx.add(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        idx.add(&[0.0, 1.0, 0.0, 0.0]).unwrap();
        idx.add(&[0.0, 0.0, 1.0, 0.0]).unwrap();
        idx.remove_at(1).unwrap();

        let mut buf = Vec::new();
        save(&idx, 7, &mut buf).unwrap();

        let snap = load(&mut buf.as_slice()).unwrap();
        assert_eq!(snap.generation, 7);
        assert_eq!(snap.index.len(), idx.len());
        assert_eq!(snap.index.dim(), 4);

        let query = [1.0f32, 0.0, 0.0, 0.0];
        let h1 = idx.search(&query, 2).unwrap();
        let h2 = snap.index.search(&query, 2).unwrap();
        assert_eq!(h1, h2);

        // Can add to a loaded index.
        let mut loaded = snap.index;
        assert_eq!(loaded.add(&[0.0, 0.0, 0.0, 1.0]).unwrap(), 2);
    }

    #[test]
    fn test_save_load_empty() {
        let idx = FlatIndex::new(4);

        let mut buf = Vec::new();
        save(&idx, 0, &mut buf).unwrap();

        let snap = load(&mut buf.as_slice()).unwrap();
        assert!(snap.index.is_empty());
        assert_eq!(snap.index.dim(), 4);
    }

    #[test]
    fn test_load_invalid_magic() {
        let bad = b"NOPE";
        assert!(load(&mut bad.as_slice()).is_err());
    }

    #[test]
    fn test_load_truncated() {
        let mut idx = FlatIndex::new(2);
        idx.add(&[1.0, 0.0]).unwrap();
        let mut buf = Vec::new();
        save(&idx, 1, &mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(matches!(load(&mut buf.as_slice()), Err(VecError::Io(_))));
    }

    #[test]
    fn test_load_trailing_bytes() {
        let idx = FlatIndex::new(2);
        let mut buf = Vec::new();
        save(&idx, 1, &mut buf).unwrap();
        buf.push(0);
        assert!(matches!(
            load(&mut buf.as_slice()),
            Err(VecError::InvalidFormat(_))
        ));
    }
}
