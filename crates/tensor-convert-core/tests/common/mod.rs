//! Writes minimal PyTorch zip checkpoints for integration tests.
//!
//! The layout matches `torch.save`: `archive/data.pkl` holds a protocol 2
//! pickle of the name -> tensor mapping, and each storage lives in
//! `archive/data/<key>` as raw little-endian bytes. Dict items are written
//! in batches of 1000 like CPython's pickler, and repeated storage keys go
//! through the memo.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Items per SETITEMS batch in CPython's pickler.
const BATCH_SIZE: usize = 1000;

/// How the tensor mapping is pickled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// `torch.save({...})`: a plain dict.
    Plain,
    /// `torch.save(model.state_dict())`: an `OrderedDict` carrying
    /// `_metadata` state.
    StateDict,
    /// `torch.save({"epoch": 7, "state_dict": model.state_dict()})`.
    Nested,
}

/// One entry of the pickled mapping.
pub struct PthTensor<'a> {
    pub name: &'a str,
    pub storage_key: &'a str,
    /// torch storage class, e.g. `FloatStorage` or `LongStorage`.
    pub storage_class: &'a str,
    /// Element count of the whole storage.
    pub storage_numel: usize,
    pub offset: usize,
    pub shape: Vec<usize>,
    pub stride: Vec<usize>,
}

impl<'a> PthTensor<'a> {
    /// Row-major tensor of `storage_class` covering its whole storage.
    pub fn new(name: &'a str, storage_key: &'a str, storage_class: &'a str, shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        let stride = row_major(&shape);
        Self {
            name,
            storage_key,
            storage_class,
            storage_numel: numel,
            offset: 0,
            shape,
            stride,
        }
    }

    pub fn f32(name: &'a str, storage_key: &'a str, shape: Vec<usize>) -> Self {
        Self::new(name, storage_key, "FloatStorage", shape)
    }
}

fn row_major(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Write a checkpoint to `path`.
pub fn write_pth(path: &Path, tensors: &[PthTensor<'_>], storages: &[(&str, Vec<u8>)], mapping: Mapping) {
    let pickle = PickleWriter::default().mapping(tensors, mapping);

    let file = File::create(path).expect("Failed to create checkpoint");
    let mut zip = zip::ZipWriter::new(file);
    let options =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);

    zip.start_file("archive/data.pkl", options).unwrap();
    zip.write_all(&pickle).unwrap();
    for (key, bytes) in storages {
        zip.start_file(format!("archive/data/{}", key), options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.start_file("archive/version", options).unwrap();
    zip.write_all(b"3\n").unwrap();
    zip.finish().unwrap();
}

#[derive(Default)]
struct PickleWriter {
    out: Vec<u8>,
    memo: HashMap<String, u32>,
}

impl PickleWriter {
    fn mapping(mut self, tensors: &[PthTensor<'_>], mapping: Mapping) -> Vec<u8> {
        self.out.extend_from_slice(&[0x80, 0x02]);
        match mapping {
            Mapping::Plain => self.state_dict(tensors, false),
            Mapping::StateDict => self.state_dict(tensors, true),
            Mapping::Nested => {
                self.out.extend_from_slice(b"}(");
                self.unicode("epoch");
                self.int(7);
                self.unicode("state_dict");
                self.state_dict(tensors, true);
                self.out.push(b'u');
            }
        }
        self.out.push(b'.');
        self.out
    }

    fn state_dict(&mut self, tensors: &[PthTensor<'_>], ordered: bool) {
        if ordered {
            self.ordered_dict();
        } else {
            self.out.push(b'}');
        }

        for batch in tensors.chunks(BATCH_SIZE) {
            if batch.len() > 1 {
                self.out.push(b'(');
            }
            for tensor in batch {
                self.unicode(tensor.name);
                self.rebuild_tensor(tensor);
            }
            self.out.push(if batch.len() > 1 { b'u' } else { b's' });
        }

        if ordered {
            // BUILD state: {"_metadata": OrderedDict({"": {"version": 1}})}
            self.out.push(b'}');
            self.unicode("_metadata");
            self.ordered_dict();
            self.unicode("");
            self.out.push(b'}');
            self.unicode("version");
            self.int(1);
            self.out.extend_from_slice(b"sssb");
        }
    }

    fn ordered_dict(&mut self) {
        self.global("collections", "OrderedDict");
        self.out.extend_from_slice(b")R");
    }

    fn rebuild_tensor(&mut self, t: &PthTensor<'_>) {
        self.global("torch._utils", "_rebuild_tensor_v2");
        self.out.push(b'(');

        // Persistent id: ("storage", class, key, location, numel)
        self.out.push(b'(');
        self.unicode("storage");
        self.global("torch", t.storage_class);
        self.memoized_unicode(t.storage_key);
        self.unicode("cpu");
        self.int(t.storage_numel);
        self.out.extend_from_slice(b"tQ");

        self.int(t.offset);
        self.int_tuple(&t.shape);
        self.int_tuple(&t.stride);
        self.out.push(0x89); // requires_grad = False
        self.ordered_dict(); // backward hooks

        self.out.extend_from_slice(b"tR");
    }

    /// A string written once and fetched from the memo afterwards, the way
    /// the pickler handles a storage key shared by tied tensors.
    fn memoized_unicode(&mut self, s: &str) {
        if let Some(&id) = self.memo.get(s) {
            self.out.push(b'j');
            self.out.extend_from_slice(&id.to_le_bytes());
            return;
        }
        let id = self.memo.len() as u32;
        self.unicode(s);
        self.out.push(b'r');
        self.out.extend_from_slice(&id.to_le_bytes());
        self.memo.insert(s.to_string(), id);
    }

    fn global(&mut self, module: &str, name: &str) {
        self.out.push(b'c');
        self.out.extend_from_slice(module.as_bytes());
        self.out.push(b'\n');
        self.out.extend_from_slice(name.as_bytes());
        self.out.push(b'\n');
    }

    fn unicode(&mut self, s: &str) {
        self.out.push(b'X');
        self.out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.out.extend_from_slice(s.as_bytes());
    }

    fn int(&mut self, v: usize) {
        if v < 256 {
            self.out.push(b'K');
            self.out.push(v as u8);
        } else {
            self.out.push(b'J');
            self.out.extend_from_slice(&(v as i32).to_le_bytes());
        }
    }

    fn int_tuple(&mut self, values: &[usize]) {
        self.out.push(b'(');
        for &v in values {
            self.int(v);
        }
        self.out.push(b't');
    }
}
