//! Face record normalizer.
//!
//! Turns the decoded value found under the backend's result key into
//! canonical [`FaceRecord`]s. Two backend layouts are accepted:
//!
//! - record shape: a sequence of per-face mappings
//!   (`bbox`, `landmark`|`kps`, `normed_embedding`|`embedding`, `det_score`)
//! - columnar shape: a mapping of index-aligned sequences
//!   (`bboxes`, `kpss`, `embeddings`)

use crate::envelope::{EnvelopeError, Mapping, Value};
use crate::types::{FaceRecord, DEFAULT_DET_SCORE, LANDMARK_POINTS};
use thiserror::Error;

const BBOX_KEY: &str = "bbox";
const LANDMARK_KEYS: [&str; 2] = ["landmark", "kps"];
const EMBEDDING_KEYS: [&str; 2] = ["normed_embedding", "embedding"];
const DET_SCORE_KEY: &str = "det_score";

const COLUMN_BBOXES: &str = "bboxes";
const COLUMN_KPSS: &str = "kpss";
const COLUMN_EMBEDDINGS: &str = "embeddings";

const BBOX_LEN: usize = 4;
const LANDMARK_LEN: usize = LANDMARK_POINTS * 2;

#[derive(Error, Debug, PartialEq)]
pub enum NormalizeError {
    #[error("face {index}: missing field `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("unsupported result format: {0}")]
    UnsupportedResultFormat(String),
    #[error("face {index}: invalid `{field}`: {detail}")]
    InvalidGeometry {
        index: usize,
        field: &'static str,
        detail: String,
    },
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Backend layout, resolved once from the value's kind.
enum ResultShape<'a> {
    Records(Vec<&'a Mapping>),
    Columnar(&'a Mapping),
}

/// Where a numeric field came from, for error messages.
#[derive(Clone, Copy)]
struct FieldRef {
    index: usize,
    field: &'static str,
}

impl FieldRef {
    fn invalid(self, detail: impl Into<String>) -> NormalizeError {
        NormalizeError::InvalidGeometry {
            index: self.index,
            field: self.field,
            detail: detail.into(),
        }
    }
}

/// Normalize a decoded backend result into face records.
///
/// An empty sequence yields an empty list. Values matching neither layout
/// fail with [`NormalizeError::UnsupportedResultFormat`].
pub fn normalize(result: &Value) -> Result<Vec<FaceRecord>, NormalizeError> {
    let faces = match classify(result)? {
        ResultShape::Records(entries) => {
            let faces = entries
                .into_iter()
                .enumerate()
                .map(|(index, entry)| record_entry(index, entry))
                .collect::<Result<Vec<_>, _>>()?;
            tracing::debug!(faces = faces.len(), shape = "records", "normalized backend result");
            faces
        }
        ResultShape::Columnar(columns) => {
            let faces = columnar(columns)?;
            tracing::debug!(faces = faces.len(), shape = "columnar", "normalized backend result");
            faces
        }
    };
    Ok(faces)
}

fn classify(result: &Value) -> Result<ResultShape<'_>, NormalizeError> {
    match result.resolved()? {
        Value::Seq(items) => {
            let mut entries = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let entry = item.resolved()?.as_mapping().ok_or_else(|| {
                    NormalizeError::UnsupportedResultFormat(format!(
                        "face entry {index} is a {}, expected a mapping",
                        item.kind()
                    ))
                })?;
                entries.push(entry);
            }
            Ok(ResultShape::Records(entries))
        }
        value => match value.as_mapping() {
            Some(columns) if columns.contains_key(COLUMN_BBOXES) => Ok(ResultShape::Columnar(columns)),
            Some(_) => Err(NormalizeError::UnsupportedResultFormat(format!(
                "{} without `{COLUMN_BBOXES}`",
                value.kind()
            ))),
            None => Err(NormalizeError::UnsupportedResultFormat(format!(
                "result is a {}",
                value.kind()
            ))),
        },
    }
}

fn record_entry(index: usize, entry: &Mapping) -> Result<FaceRecord, NormalizeError> {
    let bbox = entry.get(BBOX_KEY).ok_or(NormalizeError::MissingField {
        index,
        field: BBOX_KEY,
    })?;
    let (landmark_key, landmark) = first_present(entry, &LANDMARK_KEYS).ok_or(NormalizeError::MissingField {
        index,
        field: LANDMARK_KEYS[0],
    })?;
    let (embedding_key, embedding) =
        first_present(entry, &EMBEDDING_KEYS).ok_or(NormalizeError::MissingField {
            index,
            field: EMBEDDING_KEYS[0],
        })?;

    let det_score = match entry.get(DET_SCORE_KEY) {
        None | Some(Value::Null) => DEFAULT_DET_SCORE,
        Some(score) => scalar(score, FieldRef { index, field: DET_SCORE_KEY })?,
    };

    Ok(FaceRecord {
        bbox: to_bbox(numbers(bbox, FieldRef { index, field: BBOX_KEY })?, FieldRef {
            index,
            field: BBOX_KEY,
        })?,
        det_score,
        landmark: to_landmarks(
            numbers(landmark, FieldRef { index, field: landmark_key })?,
            FieldRef { index, field: landmark_key },
        )?,
        embedding: to_f32(numbers(embedding, FieldRef { index, field: embedding_key })?),
    })
}

fn columnar(columns: &Mapping) -> Result<Vec<FaceRecord>, NormalizeError> {
    let bboxes = match columns.get(COLUMN_BBOXES) {
        Some(v) => rows(v, COLUMN_BBOXES)?,
        None => Vec::new(),
    };
    let kpss = optional_rows(columns, COLUMN_KPSS)?;
    let embeddings = optional_rows(columns, COLUMN_EMBEDDINGS)?;

    bboxes
        .into_iter()
        .enumerate()
        .map(|(index, bbox)| {
            let landmark = match kpss.get(index) {
                Some(kps) => to_landmarks(kps.clone(), FieldRef { index, field: COLUMN_KPSS })?,
                None => Vec::new(),
            };
            let embedding = embeddings.get(index).map(|e| to_f32(e.clone())).unwrap_or_default();
            Ok(FaceRecord {
                bbox: to_bbox(bbox, FieldRef { index, field: COLUMN_BBOXES })?,
                det_score: DEFAULT_DET_SCORE,
                landmark,
                embedding,
            })
        })
        .collect()
}

fn first_present<'a>(entry: &'a Mapping, keys: &[&'static str]) -> Option<(&'static str, &'a Value)> {
    keys.iter()
        .find_map(|&key| entry.get(key).map(|value| (key, value)))
}

/// Columns absent or `null` count as empty.
fn optional_rows(columns: &Mapping, key: &'static str) -> Result<Vec<Vec<f64>>, NormalizeError> {
    match columns.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => rows(v, key),
    }
}

/// Split a column along its first axis, flattening each row.
fn rows(column: &Value, field: &'static str) -> Result<Vec<Vec<f64>>, NormalizeError> {
    match column.resolved()? {
        Value::Seq(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| numbers(item, FieldRef { index, field }))
            .collect(),
        Value::Array(array) => array
            .rows()
            .map(|rows| rows.iter().map(|row| row.to_flat_vec()).collect())
            .ok_or_else(|| {
                NormalizeError::UnsupportedResultFormat(format!("column `{field}` is a 0-d array"))
            }),
        other => Err(NormalizeError::UnsupportedResultFormat(format!(
            "column `{field}` is a {}",
            other.kind()
        ))),
    }
}

/// All numbers in a (possibly nested) numeric value, row-major.
fn numbers(value: &Value, at: FieldRef) -> Result<Vec<f64>, NormalizeError> {
    let mut out = Vec::new();
    collect_numbers(value, at, &mut out)?;
    Ok(out)
}

fn collect_numbers(value: &Value, at: FieldRef, out: &mut Vec<f64>) -> Result<(), NormalizeError> {
    match value.resolved()? {
        Value::Array(array) => out.extend(array.to_flat_vec()),
        Value::Seq(items) => {
            for item in items {
                collect_numbers(item, at, out)?;
            }
        }
        other => {
            let n = other
                .as_f64()
                .ok_or_else(|| at.invalid(format!("expected numbers, found {}", other.kind())))?;
            out.push(n);
        }
    }
    Ok(())
}

fn scalar(value: &Value, at: FieldRef) -> Result<f32, NormalizeError> {
    match numbers(value, at)?.as_slice() {
        [v] => Ok(*v as f32),
        other => Err(at.invalid(format!("expected one number, got {}", other.len()))),
    }
}

fn to_bbox(values: Vec<f64>, at: FieldRef) -> Result<[f32; 4], NormalizeError> {
    match values.as_slice() {
        [x1, y1, x2, y2] => Ok([*x1 as f32, *y1 as f32, *x2 as f32, *y2 as f32]),
        _ => Err(at.invalid(format!("expected {BBOX_LEN} numbers, got {}", values.len()))),
    }
}

/// Reshape a flat buffer into (x, y) pairs: `[v0, v1], [v2, v3], ...`.
fn to_landmarks(values: Vec<f64>, at: FieldRef) -> Result<Vec<[f32; 2]>, NormalizeError> {
    if values.len() != LANDMARK_LEN {
        return Err(at.invalid(format!(
            "expected {LANDMARK_LEN} numbers ({LANDMARK_POINTS} points), got {}",
            values.len()
        )));
    }
    Ok(values
        .chunks_exact(2)
        .map(|p| [p[0] as f32, p[1] as f32])
        .collect())
}

fn to_f32(values: Vec<f64>) -> Vec<f32> {
    values.into_iter().map(|v| v as f32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::decode;
    use crate::numeric::{DType, NumericArray};

    fn result(text: &str) -> Value {
        decode(text).unwrap()
    }

    #[test]
    fn test_record_shape() {
        let faces = normalize(&result(
            r#"[{"bbox":[1,2,3,4],"landmark":[0,0,0,0,0,0,0,0,0,0],"normed_embedding":[0.1,0.2]}]"#,
        ))
        .unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(faces[0].landmark, vec![[0.0, 0.0]; 5]);
        assert_eq!(faces[0].embedding, vec![0.1f32, 0.2f32]);
        assert_eq!(faces[0].det_score, DEFAULT_DET_SCORE);
    }

    #[test]
    fn test_landmark_reshape_row_major() {
        let faces = normalize(&result(
            r#"[{"bbox":[1,2,3,4],"landmark":[0,1,2,3,4,5,6,7,8,9],"normed_embedding":[]}]"#,
        ))
        .unwrap();
        assert_eq!(
            faces[0].landmark,
            vec![[0.0, 1.0], [2.0, 3.0], [4.0, 5.0], [6.0, 7.0], [8.0, 9.0]]
        );
    }

    #[test]
    fn test_nested_landmarks_flatten() {
        let faces = normalize(&result(
            r#"[{"bbox":[1,2,3,4],"kps":[[0,1],[2,3],[4,5],[6,7],[8,9]],"embedding":[1.0]}]"#,
        ))
        .unwrap();
        assert_eq!(faces[0].landmark[4], [8.0, 9.0]);
        assert_eq!(faces[0].embedding, vec![1.0]);
    }

    #[test]
    fn test_columnar_shape() {
        let columnar = normalize(&result(
            r#"{"bboxes":[[1,2,3,4]],"kpss":[[0,0,0,0,0,0,0,0,0,0]],"embeddings":[[0.5]]}"#,
        ))
        .unwrap();
        let record = normalize(&result(
            r#"[{"bbox":[1,2,3,4],"landmark":[0,0,0,0,0,0,0,0,0,0],"normed_embedding":[0.5]}]"#,
        ))
        .unwrap();
        assert_eq!(columnar, record);
    }

    #[test]
    fn test_columnar_missing_columns_default_empty() {
        let faces = normalize(&result(r#"{"bboxes":[[1,2,3,4],[5,6,7,8]],"kpss":null}"#)).unwrap();
        assert_eq!(faces.len(), 2);
        assert!(faces[1].landmark.is_empty());
        assert!(faces[1].embedding.is_empty());
        assert_eq!(faces[1].bbox, [5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_columnar_short_column() {
        let faces = normalize(&result(
            r#"{"bboxes":[[1,2,3,4],[5,6,7,8]],"embeddings":[[0.25]]}"#,
        ))
        .unwrap();
        assert_eq!(faces[0].embedding, vec![0.25]);
        assert!(faces[1].embedding.is_empty());
    }

    #[test]
    fn test_columnar_numpy_arrays() {
        let mut columns = Mapping::new();
        columns.insert(
            "bboxes".into(),
            NumericArray::from_vec(DType::Float32, &[2, 4], (0..8).map(f64::from).collect())
                .unwrap()
                .into(),
        );
        columns.insert(
            "kpss".into(),
            NumericArray::from_vec(DType::Float32, &[2, 5, 2], (0..20).map(f64::from).collect())
                .unwrap()
                .into(),
        );
        columns.insert(
            "embeddings".into(),
            NumericArray::from_vec(DType::Float32, &[2, 3], vec![0.5; 6]).unwrap().into(),
        );
        let faces = normalize(&Value::Map(columns)).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[1].bbox, [4.0, 5.0, 6.0, 7.0]);
        assert_eq!(faces[1].landmark[0], [10.0, 11.0]);
        assert_eq!(faces[1].embedding.len(), 3);
    }

    #[test]
    fn test_insightface_object_entries() {
        let faces = normalize(&result(
            r#"[{"py/object":"insightface.app.common.Face",
                 "bbox":{"py/object":"numpy.ndarray","dtype":"float32","values":[10.5,20.5,30.5,40.5]},
                 "kps":{"py/object":"numpy.ndarray","dtype":"float32","values":[[1,2],[3,4],[5,6],[7,8],[9,10]]},
                 "det_score":{"py/object":"numpy.float32","dtype":"float32","value":0.875},
                 "embedding":{"py/object":"numpy.ndarray","dtype":"float32","values":[0.5,-0.5]}}]"#,
        ))
        .unwrap();
        assert_eq!(faces[0].bbox, [10.5, 20.5, 30.5, 40.5]);
        assert_eq!(faces[0].det_score, 0.875);
        assert_eq!(faces[0].landmark[2], [5.0, 6.0]);
        assert_eq!(faces[0].embedding, vec![0.5, -0.5]);
    }

    #[test]
    fn test_empty_detections() {
        assert!(normalize(&result("[]")).unwrap().is_empty());
    }

    #[test]
    fn test_unsupported_shapes() {
        for text in [r#""unexpected-string""#, "42", "null", r#"{"faces":[]}"#, "[1, 2]"] {
            let err = normalize(&result(text)).unwrap_err();
            assert!(
                matches!(err, NormalizeError::UnsupportedResultFormat(_)),
                "{text}: {err:?}"
            );
        }
    }

    #[test]
    fn test_missing_geometry_fields() {
        let err = normalize(&result(r#"[{"landmark":[0,0,0,0,0,0,0,0,0,0],"embedding":[]}]"#)).unwrap_err();
        assert_eq!(err, NormalizeError::MissingField { index: 0, field: "bbox" });

        let err = normalize(&result(r#"[{"bbox":[1,2,3,4],"embedding":[]}]"#)).unwrap_err();
        assert_eq!(err, NormalizeError::MissingField { index: 0, field: "landmark" });

        let err = normalize(&result(
            r#"[{"bbox":[1,2,3,4],"kps":[0,0,0,0,0,0,0,0,0,0]}]"#,
        ))
        .unwrap_err();
        assert_eq!(err, NormalizeError::MissingField { index: 0, field: "normed_embedding" });
    }

    #[test]
    fn test_wrong_landmark_count() {
        let err = normalize(&result(
            r#"[{"bbox":[1,2,3,4],"landmark":[0,1,2,3],"embedding":[]}]"#,
        ))
        .unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidGeometry { field: "landmark", .. }));
    }

    #[test]
    fn test_non_numeric_bbox() {
        let err = normalize(&result(
            r#"[{"bbox":[1,2,"x",4],"landmark":[0,0,0,0,0,0,0,0,0,0],"embedding":[]}]"#,
        ))
        .unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidGeometry { field: "bbox", .. }));
    }

    #[test]
    fn test_unresolved_field_fails_on_read() {
        let err = normalize(&result(
            r#"[{"bbox":[1,2,3,4],"landmark":[0,0,0,0,0,0,0,0,0,0],"embedding":[],
                 "det_score":{"py/reduce":[{"py/function":"numpy.core.multiarray.scalar"}]}}]"#,
        ))
        .unwrap_err();
        assert_eq!(err, NormalizeError::Envelope(EnvelopeError::TagResolution("py/reduce".into())));
    }

    #[test]
    fn test_unresolved_unused_field_is_ignored() {
        let faces = normalize(&result(
            r#"[{"bbox":[1,2,3,4],"landmark":[0,0,0,0,0,0,0,0,0,0],"embedding":[],
                 "gender":{"py/reduce":[]}}]"#,
        ))
        .unwrap();
        assert_eq!(faces.len(), 1);
    }
}
