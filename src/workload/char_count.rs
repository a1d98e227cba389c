//! Letter frequencies.
//!
//! With `-- --distinct` the reducer only lists the letters that occur and
//! never pulls their values.

use crate::*;
use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use clap::Parser;
use std::path::Path;

#[derive(Parser, Debug, Default)]
#[clap(no_binary_name = true)]
struct Args {
    #[clap(long)]
    distinct: bool,
}

fn parse_args(aux: &Bytes) -> Result<Args> {
    if aux.is_empty() {
        return Ok(Args::default());
    }
    Ok(Args::try_parse_from(serde_json::from_slice::<Vec<String>>(aux)?)?)
}

pub fn map(path: &Path, emitter: &Emitter, _aux: &Bytes) -> Result<()> {
    let buf = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let s = String::from_utf8(buf)?;

    let mut key_buf = [0u8; 4];
    for c in s.chars().filter(|c| c.is_alphabetic()).flat_map(char::to_lowercase) {
        emitter.emit(c.encode_utf8(&mut key_buf).as_bytes(), b"");
    }
    Ok(())
}

pub fn reduce(key: Bytes, values: &mut Cursor<'_>, aux: &Bytes) -> Result<Bytes> {
    let args = parse_args(aux)?;
    let letter = utils::string_from_bytes(key.clone())?;

    let mut writer = BytesMut::with_capacity(8);
    if args.distinct {
        writer.put(format!("{}\n", letter).as_bytes());
    } else {
        let count = values.values(&key).count();
        writer.put(format!("{} {}\n", letter, count).as_bytes());
    }
    Ok(writer.freeze())
}
