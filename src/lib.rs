pub mod asm;
pub mod elf;
pub mod error;
pub mod postprocess;
pub mod preprocess;

use std::borrow::Cow;
use std::path::PathBuf;
use std::str::FromStr;

use clap::ValueEnum;

pub use error::{Error, Result};

/// Text encoding for C sources in and out. `latin1` gets a fast path since it
/// is what the IRIX toolchain expects; anything else goes through a labeled
/// encoding_rs encoding.
#[derive(Clone, Debug)]
pub enum Encoding {
    Latin1,
    Custom(&'static encoding_rs::Encoding),
}

impl Encoding {
    pub fn encode<'a>(&self, s: &'a str) -> Result<Cow<'a, [u8]>> {
        match self {
            Encoding::Latin1 => {
                if encoding_rs::mem::is_str_latin1(s) {
                    return Ok(encoding_rs::mem::encode_latin1_lossy(s));
                }
            }
            Encoding::Custom(enc) => {
                let (ret, _, failed) = enc.encode(s);
                if !failed {
                    return Ok(ret);
                }
            }
        }
        Err(Error::Config(format!("failed to encode string: {}", s)))
    }

    pub fn decode<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, str>> {
        match self {
            Encoding::Latin1 => Ok(encoding_rs::mem::decode_latin1(data)),
            Encoding::Custom(enc) => {
                let (ret, _, had_errors) = enc.decode(data);
                if had_errors {
                    return Err(Error::Config(format!(
                        "failed to decode input as {}",
                        enc.name()
                    )));
                }
                Ok(ret)
            }
        }
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "latin1" || s == "latin-1" {
            Ok(Encoding::Latin1)
        } else {
            match encoding_rs::Encoding::for_label(s.as_bytes()) {
                Some(enc) => Ok(Encoding::Custom(enc)),
                None => Err(format!("unsupported encoding: {}", s)),
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, ValueEnum)]
pub enum SymbolVisibility {
    No,
    #[default]
    Local,
    Global,
    GlobalWithFilename,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    G,
    G3,
}

/// Per-invocation configuration, constructed once from the CLI.
#[derive(Clone, Debug)]
pub struct ProcOpts {
    pub filename: PathBuf,
    pub opt: OptLevel,
    pub framepointer: bool,
    pub mips1: bool,
    pub kpic: bool,
    pub pascal: bool,
    pub input_enc: Encoding,
    pub output_enc: Encoding,
    pub encode_cutscene_data_floats: bool,
}
