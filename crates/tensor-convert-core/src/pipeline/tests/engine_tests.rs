//! Per-file and batch conversion tests.
//!
//! Bundles come from `MemorySource`; the `.bin` files on disk are
//! placeholders that only feed discovery and the size check.

use std::fs;
use std::path::{Path, PathBuf};

use safetensors::SafeTensors;
use tempfile::TempDir;

use crate::config::ConvertConfig;
use crate::error::ConvertError;
use crate::source::MemorySource;
use crate::tensor::{DType, Storage, TensorBundle, TensorHandle};

use super::super::engine::Converter;
use super::super::state::ConversionState;

/// Large enough that any small bundle's output is a shrink.
const PLACEHOLDER_BYTES: usize = 1 << 20;

fn f32_storage(key: &str, values: &[f32]) -> Storage {
    Storage::new(key, bytemuck::cast_slice::<f32, u8>(values).to_vec())
}

fn placeholder(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, vec![0u8; len]).expect("Failed to write placeholder");
    path
}

/// `{"a": T1, "b": alias(a), "c": T2}`
fn tied_bundle() -> TensorBundle {
    let t1 = f32_storage("s0", &[1.0, 2.0, 3.0, 4.0]);
    let t2 = f32_storage("s1", &[5.0, 6.0]);
    let a = TensorHandle::contiguous("a", DType::F32, vec![2, 2], t1);
    let b = a.view("b", vec![2, 2], vec![2, 1], 0);
    let c = TensorHandle::contiguous("c", DType::F32, vec![2], t2);
    [a, b, c].into_iter().collect()
}

/// A view that reaches past its storage.
fn broken_bundle() -> TensorBundle {
    let storage = f32_storage("s0", &[1.0]);
    [TensorHandle::new("bad", DType::F32, vec![8], vec![1], 0, storage)]
        .into_iter()
        .collect()
}

fn read_f32(st: &SafeTensors<'_>, name: &str) -> Vec<f32> {
    st.tensor(name)
        .expect("tensor missing")
        .data()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ============================================================================
// Single file
// ============================================================================

#[test]
fn test_convert_file_drops_alias_and_verifies() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let source = placeholder(dir.path(), "model.bin", PLACEHOLDER_BYTES);
    let target = dir.path().join("model.safetensors");

    let memory = MemorySource::new().with_bundle(&source, tied_bundle());
    let converter = Converter::with_source(ConvertConfig::default(), memory).unwrap();

    let report = converter.convert_file(&source, &target).unwrap();
    assert_eq!(report.state, ConversionState::Done);
    assert_eq!(report.tensors_loaded, 3);
    assert_eq!(report.dropped, vec!["b".to_string()]);
    assert_eq!(report.alias_groups.len(), 1);
    assert_eq!(report.tensors_written, 2);
    assert_eq!(report.source_bytes, PLACEHOLDER_BYTES as u64);
    assert!(report.growth.is_some_and(|g| g < 0.0));
    assert_eq!(report.target_sha256.as_deref().map(str::len), Some(64));

    let bytes = fs::read(&target).unwrap();
    let st = SafeTensors::deserialize(&bytes).unwrap();
    let mut names: Vec<&String> = st.names();
    names.sort();
    assert_eq!(names, vec!["a", "c"]);
    assert_eq!(read_f32(&st, "a"), vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(read_f32(&st, "c"), vec![5.0, 6.0]);

    let (_, header) = SafeTensors::read_metadata(&bytes).unwrap();
    let metadata = header.metadata().clone().unwrap_or_default();
    assert_eq!(metadata.get("format").map(String::as_str), Some("pt"));
}

#[test]
fn test_convert_file_writes_transposed_view_row_major() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let source = placeholder(dir.path(), "t.bin", PLACEHOLDER_BYTES);
    let target = dir.path().join("t.safetensors");

    let storage = f32_storage("s0", &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    let transposed = TensorHandle::new("w_t", DType::F32, vec![3, 2], vec![1, 3], 0, storage);
    let memory = MemorySource::new().with_bundle(&source, [transposed].into_iter().collect());
    let converter = Converter::with_source(ConvertConfig::default(), memory).unwrap();

    converter.convert_file(&source, &target).unwrap();

    let bytes = fs::read(&target).unwrap();
    let st = SafeTensors::deserialize(&bytes).unwrap();
    assert_eq!(st.tensor("w_t").unwrap().shape(), &[3, 2]);
    assert_eq!(read_f32(&st, "w_t"), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
}

#[test]
fn test_size_mismatch_leaves_output_on_disk() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let source = placeholder(dir.path(), "tiny.bin", 10);
    let target = dir.path().join("tiny.safetensors");

    let memory = MemorySource::new().with_bundle(&source, tied_bundle());
    let converter = Converter::with_source(ConvertConfig::default(), memory).unwrap();

    let err = converter.convert_file(&source, &target).unwrap_err();
    assert!(matches!(err, ConvertError::SizeMismatch { old_size: 10, .. }));
    assert_eq!(err.exit_code(), 7);
    assert!(target.exists());
}

#[test]
fn test_materialize_failure_writes_nothing() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let source = placeholder(dir.path(), "broken.bin", PLACEHOLDER_BYTES);
    let target = dir.path().join("broken.safetensors");

    let memory = MemorySource::new().with_bundle(&source, broken_bundle());
    let converter = Converter::with_source(ConvertConfig::default(), memory).unwrap();

    let err = converter.convert_file(&source, &target).unwrap_err();
    assert!(matches!(err, ConvertError::MaterializeFailed { .. }));
    assert!(!target.exists());
}

#[test]
fn test_empty_source_is_rejected_before_loading() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let source = placeholder(dir.path(), "empty.bin", 0);
    let target = dir.path().join("empty.safetensors");

    // No bundle registered: loading would fail with a different error.
    let converter = Converter::with_source(ConvertConfig::default(), MemorySource::new()).unwrap();

    let err = converter.convert_file(&source, &target).unwrap_err();
    assert!(matches!(err, ConvertError::EmptySourceFile { .. }));
    assert!(!target.exists());
}

#[test]
fn test_output_parent_is_created() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let source = placeholder(dir.path(), "model.bin", PLACEHOLDER_BYTES);
    let target = dir.path().join("out/nested/model.safetensors");

    let memory = MemorySource::new().with_bundle(&source, tied_bundle());
    let converter = Converter::with_source(ConvertConfig::default(), memory).unwrap();

    converter.convert_file(&source, &target).unwrap();
    assert!(target.exists());
}

#[test]
fn test_converter_keeps_validated_config() {
    let config = ConvertConfig::default()
        .with_size_tolerance(0.05)
        .with_continue_on_error(true);
    let converter = Converter::with_source(config, MemorySource::new()).unwrap();
    assert_eq!(converter.config().size_tolerance, 0.05);
    assert!(converter.config().continue_on_error);
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = ConvertConfig::default().with_size_tolerance(-1.0);
    let result = Converter::with_source(config, MemorySource::new());
    assert!(matches!(result, Err(ConvertError::InvalidConfig { .. })));
}

// ============================================================================
// Batch
// ============================================================================

#[test]
fn test_directory_converts_every_bin() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let first = placeholder(dir.path(), "a.bin", PLACEHOLDER_BYTES);
    let second = placeholder(dir.path(), "b.bin", PLACEHOLDER_BYTES);
    placeholder(dir.path(), "readme.txt", 4);

    let memory = MemorySource::new()
        .with_bundle(&first, tied_bundle())
        .with_bundle(&second, tied_bundle());
    let converter = Converter::with_source(ConvertConfig::default(), memory).unwrap();

    let report = converter.convert_directory(dir.path()).unwrap();
    assert_eq!(report.files.len(), 2);
    assert!(report.all_succeeded());
    assert_eq!(report.dropped_count(), 2);
    assert_eq!(report.files[0].source, first);
    assert!(dir.path().join("a.safetensors").exists());
    assert!(dir.path().join("b.safetensors").exists());
    assert!(!dir.path().join("readme.safetensors").exists());
}

#[test]
fn test_directory_aborts_on_first_failure_by_default() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let first = placeholder(dir.path(), "a.bin", PLACEHOLDER_BYTES);
    let second = placeholder(dir.path(), "b.bin", PLACEHOLDER_BYTES);

    let memory = MemorySource::new()
        .with_bundle(&first, broken_bundle())
        .with_bundle(&second, tied_bundle());
    let converter = Converter::with_source(ConvertConfig::default(), memory).unwrap();

    let err = converter.convert_directory(dir.path()).unwrap_err();
    assert!(matches!(err, ConvertError::MaterializeFailed { .. }));
    assert!(!dir.path().join("b.safetensors").exists());
}

#[test]
fn test_directory_continue_on_error_records_failure() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let first = placeholder(dir.path(), "a.bin", PLACEHOLDER_BYTES);
    let second = placeholder(dir.path(), "b.bin", PLACEHOLDER_BYTES);

    let memory = MemorySource::new()
        .with_bundle(&first, broken_bundle())
        .with_bundle(&second, tied_bundle());
    let config = ConvertConfig::default().with_continue_on_error(true);
    let converter = Converter::with_source(config, memory).unwrap();

    let report = converter.convert_directory(dir.path()).unwrap();
    assert!(report.any_failed());
    assert_eq!(report.converted_count(), 1);
    assert_eq!(report.failed_count(), 1);

    match &report.files[0].state {
        ConversionState::Failed { stage, reason } => {
            assert_eq!(stage, "materialized");
            assert!(reason.contains("[CNV-E006]"));
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert_eq!(report.files[1].state, ConversionState::Done);
    assert!(dir.path().join("b.safetensors").exists());
}

#[test]
fn test_directory_input_error_aborts_despite_continue_on_error() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    placeholder(dir.path(), "a.bin", 0);
    let second = placeholder(dir.path(), "b.bin", PLACEHOLDER_BYTES);

    let memory = MemorySource::new().with_bundle(&second, tied_bundle());
    let config = ConvertConfig::default().with_continue_on_error(true);
    let converter = Converter::with_source(config, memory).unwrap();

    let err = converter.convert_directory(dir.path()).unwrap_err();
    assert!(matches!(err, ConvertError::EmptySourceFile { .. }));
    assert!(!dir.path().join("b.safetensors").exists());
}

#[test]
fn test_directory_without_inputs_writes_nothing() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    placeholder(dir.path(), "model.pt", PLACEHOLDER_BYTES);

    let converter = Converter::with_source(ConvertConfig::default(), MemorySource::new()).unwrap();
    let err = converter.convert_directory(dir.path()).unwrap_err();

    assert!(matches!(err, ConvertError::NoInputFiles { .. }));
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn test_directory_honours_output_dir() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let out = TempDir::new().expect("Failed to create temp dir");
    let source = placeholder(dir.path(), "model.bin", PLACEHOLDER_BYTES);

    let memory = MemorySource::new().with_bundle(&source, tied_bundle());
    let config = ConvertConfig::default().with_output_dir(out.path().join("converted"));
    let converter = Converter::with_source(config, memory).unwrap();

    let report = converter.convert_directory(dir.path()).unwrap();
    let expected = out.path().join("converted/model.safetensors");
    assert_eq!(report.files[0].target, expected);
    assert!(expected.exists());
    assert!(!dir.path().join("model.safetensors").exists());
}

#[test]
fn test_load_failure_is_recorded_at_load_stage() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    placeholder(dir.path(), "unknown.bin", PLACEHOLDER_BYTES);

    let config = ConvertConfig::default().with_continue_on_error(true);
    let converter = Converter::with_source(config, MemorySource::new()).unwrap();

    let report = converter.convert_directory(dir.path()).unwrap();
    assert!(matches!(
        &report.files[0].state,
        ConversionState::Failed { stage, .. } if stage == "loaded"
    ));
    assert!(!report.all_succeeded());
}
