//! A MapReduce-compatible implementation of `grep`.
//!

use crate::*;
use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Parser, Debug, Serialize, Deserialize)]
#[clap(no_binary_name = true)]
struct Args {
    #[clap(short, long, value_parser)]
    term: String,
}

pub fn map(path: &Path, emitter: &Emitter, aux: &Bytes) -> Result<()> {
    let args = Args::try_parse_from(serde_json::from_slice::<Vec<String>>(aux)?)?;
    let term = args.term;

    let buf = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let s = String::from_utf8(buf)?;
    let filename = path.to_string_lossy();

    let mut value_buf = BytesMut::new();
    for (line_num, line) in s
        .lines()
        .enumerate()
        .filter(|(_, line)| line.contains(&term))
    {
        value_buf.put_u64(line_num as u64 + 1);
        value_buf.put(line.as_bytes());
        emitter.emit(filename.as_bytes(), value_buf.split());
    }
    Ok(())
}

pub fn reduce(key: Bytes, values: &mut Cursor<'_>, _aux: &Bytes) -> Result<Bytes> {
    let mut writer = BytesMut::with_capacity(8);
    // Mappers for one file may interleave; restore line order.
    let mut values = values.values(&key).collect::<Vec<Bytes>>();
    values.sort_by_key(|value| value.clone().get_u64());
    let filename = utils::string_from_bytes(key)?;
    for mut value in values {
        let line_no = value.get_u64();
        let line = utils::string_from_bytes(value)?;
        writer.put(format!("{}:{}:: {}\n", filename, line_no, line).as_bytes());
    }

    Ok(writer.freeze())
}
