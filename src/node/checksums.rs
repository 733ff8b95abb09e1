use md5::{Digest as _, Md5};
use sha1::Sha1;
use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};
use crate::metadata::{prefixes, Attributes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    Sha1,
    Md5,
    Adler32,
}

impl ChecksumType {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha1" => Ok(ChecksumType::Sha1),
            "md5" => Ok(ChecksumType::Md5),
            "adler32" => Ok(ChecksumType::Adler32),
            other => Err(Error::invalid(format!("unsupported checksum algorithm: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Md5 => "md5",
            ChecksumType::Adler32 => "adler32",
        }
    }

    pub fn attr_key(&self) -> &'static str {
        match self {
            ChecksumType::Sha1 => prefixes::CHECKSUM_SHA1,
            ChecksumType::Md5 => prefixes::CHECKSUM_MD5,
            ChecksumType::Adler32 => prefixes::CHECKSUM_ADLER32,
        }
    }
}

/// A client declared checksum in `"<algo> <hex>"` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredChecksum {
    pub kind: ChecksumType,
    pub hex: String,
}

impl DeclaredChecksum {
    pub fn parse(s: &str) -> Result<Self> {
        let (algo, value) = s
            .trim()
            .split_once(' ')
            .ok_or_else(|| Error::invalid(format!("invalid checksum header: {}", s)))?;
        let kind = ChecksumType::parse(algo)?;
        let hex = value.trim().to_ascii_lowercase();
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::invalid(format!("invalid checksum value: {}", value)));
        }
        Ok(Self { kind, hex })
    }
}

/// Raw digests of one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksums {
    pub sha1: Vec<u8>,
    pub md5: Vec<u8>,
    pub adler32: Vec<u8>,
}

impl Checksums {
    pub fn compute<R: Read>(mut reader: R) -> Result<Self> {
        let mut sha = Sha1::new();
        let mut md = Md5::new();
        let mut ad = adler::Adler32::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            sha.update(&buf[..n]);
            md.update(&buf[..n]);
            ad.write_slice(&buf[..n]);
        }
        Ok(Self {
            sha1: sha.finalize().to_vec(),
            md5: md.finalize().to_vec(),
            adler32: ad.checksum().to_be_bytes().to_vec(),
        })
    }

    pub fn compute_file(path: &Path) -> Result<Self> {
        let f = std::fs::File::open(path)?;
        Checksums::compute(std::io::BufReader::new(f))
    }

    pub fn hex(&self, kind: ChecksumType) -> String {
        match kind {
            ChecksumType::Sha1 => hex::encode(&self.sha1),
            ChecksumType::Md5 => hex::encode(&self.md5),
            ChecksumType::Adler32 => hex::encode(&self.adler32),
        }
    }

    pub fn verify(&self, declared: &DeclaredChecksum) -> Result<()> {
        let actual = self.hex(declared.kind);
        if actual != declared.hex {
            return Err(Error::checksum_mismatch(format!(
                "{} mismatch: declared {} computed {}",
                declared.kind.as_str(),
                declared.hex,
                actual
            )));
        }
        Ok(())
    }

    pub fn to_attributes(&self, attrs: &mut Attributes) {
        attrs.set(prefixes::CHECKSUM_SHA1, self.sha1.clone());
        attrs.set(prefixes::CHECKSUM_MD5, self.md5.clone());
        attrs.set(prefixes::CHECKSUM_ADLER32, self.adler32.clone());
    }
}

/// Compare the checksums recorded on two attribute sets.
/// `None` when either side lacks one of them, so no decision can be made.
pub fn checksums_equal(a: &Attributes, b: &Attributes) -> Option<bool> {
    let keys = [prefixes::CHECKSUM_SHA1, prefixes::CHECKSUM_MD5, prefixes::CHECKSUM_ADLER32];
    for k in keys {
        match (a.get(k), b.get(k)) {
            (Some(x), Some(y)) if !x.is_empty() && !y.is_empty() => {
                if x != y {
                    return Some(false);
                }
            }
            _ => return None,
        }
    }
    Some(true)
}
