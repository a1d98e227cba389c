//! A MapReduce-compatible implementation of word count.
//!

use crate::*;
use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::Path;

pub fn map(path: &Path, emitter: &Emitter, _aux: &Bytes) -> Result<()> {
    let buf = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let s = String::from_utf8(buf)?;

    let mut value_buf = BytesMut::with_capacity(8);
    value_buf.put_u64(1);
    let one = value_buf.freeze();

    s.split(|c: char| !c.is_alphabetic())
        .filter(|s| !s.is_empty())
        .for_each(|word| emitter.emit(word.to_lowercase(), &one));
    Ok(())
}

pub fn reduce(key: Bytes, values: &mut Cursor<'_>, _aux: &Bytes) -> Result<Bytes> {
    let count: u64 = values.values(&key).map(|mut value| value.get_u64()).sum();

    let mut writer = BytesMut::with_capacity(8);
    let key = utils::string_from_bytes(key)?;
    writer.put(format!("{} {}\n", key, count).as_bytes());

    Ok(writer.freeze())
}
