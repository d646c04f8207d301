//! Raw `f32` arrays in the NPY format.

use std::path::Path;

use ndarray::ArrayD;
use ndarray_npy::{read_npy, write_npy};

use crate::traits::{CameraError, Result};

/// Write `array` in C order to `path`, replacing any existing file.
pub fn write(path: &Path, array: &ArrayD<f32>) -> Result<()> {
    write_npy(path, array).map_err(|err| CameraError::Npy(format!("{}: {err}", path.display())))
}

/// Read a C-ordered little-endian `f32` array.
pub fn read(path: &Path) -> Result<ArrayD<f32>> {
    read_npy(path).map_err(|err| CameraError::Npy(format!("{}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.npy");
        let array = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![0.0, 1.5, -2.0, 3.25, 1e6, 7.0])
            .expect("array");

        write(&path, &array).expect("write");
        assert_eq!(read(&path).expect("read"), array);
    }

    #[test]
    fn test_file_starts_with_numpy_magic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("m.npy");
        let array = ArrayD::<f32>::zeros(IxDyn(&[4, 5]));
        write(&path, &array).expect("write");

        let bytes = std::fs::read(&path).expect("read bytes");
        assert!(bytes.starts_with(b"\x93NUMPY"));
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("'descr': '<f4'"));
        assert!(text.contains("(4, 5)"));
    }

    #[test]
    fn test_read_rejects_other_dtype() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("b.npy");
        let wide = ArrayD::<f64>::zeros(IxDyn(&[3]));
        write_npy(&path, &wide).expect("write f64");

        assert!(matches!(read(&path), Err(CameraError::Npy(_))));
    }

    #[test]
    fn test_read_rejects_truncated_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.npy");
        let array = ArrayD::from_shape_vec(IxDyn(&[4]), vec![1.0, 2.0, 3.0, 4.0]).expect("array");
        write(&path, &array).expect("write");

        let mut bytes = std::fs::read(&path).expect("read bytes");
        bytes.truncate(bytes.len() - 4);
        std::fs::write(&path, bytes).expect("rewrite");
        assert!(matches!(read(&path), Err(CameraError::Npy(_))));
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            read(&dir.path().join("absent.npy")),
            Err(CameraError::Npy(_))
        ));
    }
}
