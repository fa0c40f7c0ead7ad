use eyre::{Report, WrapErr};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Cursor, Write};
use std::path::Path;

pub fn json_read_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(filepath: P) -> Result<T, Report> {
  let filepath = filepath.as_ref();
  let file = File::open(filepath).wrap_err_with(|| format!("When opening file '{}'", filepath.display()))?;
  json_read(BufReader::with_capacity(32 * 1024, file))
    .wrap_err_with(|| format!("When reading JSON file: '{}'", filepath.display()))
}

pub fn json_read_str<T: for<'de> Deserialize<'de>>(s: impl AsRef<str>) -> Result<T, Report> {
  json_read(Cursor::new(s.as_ref())).wrap_err("When reading JSON string")
}

pub fn json_read<T: for<'de> Deserialize<'de>>(reader: impl std::io::Read) -> Result<T, Report> {
  serde_json::from_reader(reader).wrap_err("When parsing JSON")
}

#[derive(Clone, Copy, Debug)]
pub struct JsonPretty(pub bool);

pub fn json_write_str<T: Serialize>(obj: &T, pretty: JsonPretty) -> Result<String, Report> {
  if pretty.0 {
    serde_json::to_string_pretty(obj)
  } else {
    serde_json::to_string(obj)
  }
  .wrap_err("When writing JSON string")
}

pub fn json_write<W: Write, T: Serialize>(writer: W, obj: &T, pretty: JsonPretty) -> Result<(), Report> {
  if pretty.0 {
    serde_json::to_writer_pretty(writer, &obj)
  } else {
    serde_json::to_writer(writer, &obj)
  }
  .wrap_err("When writing JSON")
}
