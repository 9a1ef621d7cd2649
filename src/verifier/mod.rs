use std::fmt;

use tracing::warn;

use crate::ir::{DataType, Tensor, WeightStore};

/// Why a shared tensor failed the parity check.
#[derive(Debug, Clone, PartialEq)]
pub enum Divergence {
    DataType { expected: DataType, actual: DataType },
    Shape { expected: Vec<usize>, actual: Vec<usize> },
    /// First element index whose value differs.
    Values { index: usize },
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Divergence::DataType { expected, actual } => {
                write!(f, "dtype {} became {}", expected, actual)
            }
            Divergence::Shape { expected, actual } => {
                write!(f, "shape {:?} became {:?}", expected, actual)
            }
            Divergence::Values { index } => write!(f, "values differ at element {}", index),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParityReport {
    pub matched: Vec<String>,
    pub mismatched: Vec<(String, Divergence)>,
    /// Present in the original store only.
    pub missing: Vec<String>,
    /// Present in the rebuilt store only.
    pub unexpected: Vec<String>,
}

impl ParityReport {
    pub fn is_lossless(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }
}

/// Compares two weight stores tensor by tensor. Float tensors may differ by
/// up to `epsilon` per element; everything else must match bit for bit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParityChecker {
    epsilon: f64,
}

impl ParityChecker {
    pub fn exact() -> Self {
        Self { epsilon: 0.0 }
    }

    pub fn with_epsilon(epsilon: f64) -> Self {
        Self { epsilon }
    }

    pub fn check_parity(&self, original: &WeightStore, rebuilt: &WeightStore) -> ParityReport {
        let mut report = ParityReport::default();
        for expected in original.iter() {
            let Some(actual) = rebuilt.get(&expected.name) else {
                report.missing.push(expected.name.clone());
                continue;
            };
            match self.compare(expected, actual) {
                None => report.matched.push(expected.name.clone()),
                Some(divergence) => {
                    warn!(name = %expected.name, %divergence, "tensor diverged");
                    report.mismatched.push((expected.name.clone(), divergence));
                }
            }
        }
        report.unexpected = rebuilt
            .iter()
            .filter(|t| !original.contains(&t.name))
            .map(|t| t.name.clone())
            .collect();
        report
    }

    fn compare(&self, expected: &Tensor, actual: &Tensor) -> Option<Divergence> {
        if expected.data_type != actual.data_type {
            return Some(Divergence::DataType {
                expected: expected.data_type,
                actual: actual.data_type,
            });
        }
        if expected.shape != actual.shape {
            return Some(Divergence::Shape {
                expected: expected.shape.clone(),
                actual: actual.shape.clone(),
            });
        }

        let elem = expected.data_type.size();
        let close = |a: &[u8], b: &[u8]| -> bool {
            if a == b {
                return true;
            }
            if self.epsilon == 0.0 {
                return false;
            }
            match expected.data_type {
                DataType::F32 => {
                    let x = f32::from_le_bytes([a[0], a[1], a[2], a[3]]) as f64;
                    let y = f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64;
                    (x - y).abs() <= self.epsilon
                }
                DataType::F64 => {
                    let mut x = [0u8; 8];
                    let mut y = [0u8; 8];
                    x.copy_from_slice(a);
                    y.copy_from_slice(b);
                    (f64::from_le_bytes(x) - f64::from_le_bytes(y)).abs() <= self.epsilon
                }
                _ => false,
            }
        };
        expected
            .data
            .chunks_exact(elem)
            .zip(actual.data.chunks_exact(elem))
            .position(|(a, b)| !close(a, b))
            .map(|index| Divergence::Values { index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_tensor(name: &str, values: &[f32]) -> Tensor {
        Tensor {
            name: name.to_string(),
            shape: vec![values.len()],
            data_type: DataType::F32,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn store(tensors: Vec<Tensor>) -> WeightStore {
        let mut store = WeightStore::new();
        for t in tensors {
            store.insert(t).unwrap();
        }
        store
    }

    #[test]
    fn test_identical_stores_are_lossless() {
        let a = store(vec![f32_tensor("w", &[1.0, 2.0]), f32_tensor("b", &[0.0])]);
        let report = ParityChecker::exact().check_parity(&a, &a.clone());
        assert!(report.is_lossless());
        assert_eq!(report.matched, vec!["w", "b"]);
    }

    #[test]
    fn test_value_shape_and_presence_divergence() {
        let original = store(vec![
            f32_tensor("w", &[1.0, 2.0, 3.0]),
            f32_tensor("b", &[0.0]),
            f32_tensor("gone", &[5.0]),
        ]);
        let rebuilt = store(vec![
            f32_tensor("w", &[1.0, 2.5, 3.0]),
            f32_tensor("b", &[0.0, 0.0]),
            f32_tensor("new", &[5.0]),
        ]);
        let report = ParityChecker::exact().check_parity(&original, &rebuilt);
        assert!(!report.is_lossless());
        assert_eq!(
            report.mismatched,
            vec![
                ("w".to_string(), Divergence::Values { index: 1 }),
                (
                    "b".to_string(),
                    Divergence::Shape {
                        expected: vec![1],
                        actual: vec![2]
                    }
                ),
            ]
        );
        assert_eq!(report.missing, vec!["gone"]);
        assert_eq!(report.unexpected, vec!["new"]);
    }

    #[test]
    fn test_epsilon_tolerates_float_noise() {
        let original = store(vec![f32_tensor("w", &[1.0])]);
        let rebuilt = store(vec![f32_tensor("w", &[1.0001])]);
        assert!(!ParityChecker::exact().check_parity(&original, &rebuilt).is_lossless());
        assert!(ParityChecker::with_epsilon(1e-3)
            .check_parity(&original, &rebuilt)
            .is_lossless());
    }
}
