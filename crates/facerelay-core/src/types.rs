use serde::{Deserialize, Serialize};

/// Detection score used when the backend omits `det_score`.
pub const DEFAULT_DET_SCORE: f32 = 0.0;

/// Number of landmark points per face: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub const LANDMARK_POINTS: usize = 5;

/// Canonical face record returned by the relay.
///
/// Serializes as `{"bbox", "det_score", "landmark", "normed_embedding"}`.
/// Geometry is passed through as the backend reported it; `x1 < x2` and
/// `y1 < y2` are not enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    /// `[x1, y1, x2, y2]` in source image pixels.
    pub bbox: [f32; 4],
    pub det_score: f32,
    /// Landmark points as `[x, y]` pairs; empty when the backend sent none.
    pub landmark: Vec<[f32; 2]>,
    /// Embedding vector (typically 512-dimensional); empty when the backend sent none.
    #[serde(rename = "normed_embedding")]
    pub embedding: Vec<f32>,
}

impl FaceRecord {
    /// Bounding box truncated to integer pixels, as drawing code wants it.
    ///
    /// This is a presentation helper; the canonical record keeps floats.
    pub fn pixel_bbox(&self) -> [i32; 4] {
        self.bbox.map(|v| v as i32)
    }

    /// Landmark points truncated to integer pixels.
    pub fn landmark_pixels(&self) -> Vec<(i32, i32)> {
        self.landmark
            .iter()
            .map(|[x, y]| (*x as i32, *y as i32))
            .collect()
    }

    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }

    /// Cosine similarity between two face embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Empty, zero or
    /// mismatched-length embeddings compare as 0.0.
    pub fn similarity(&self, other: &FaceRecord) -> f32 {
        if self.embedding.len() != other.embedding.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.embedding.iter().zip(other.embedding.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// Body returned by the service boundary on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacesResponse {
    pub faces: Vec<FaceRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(embedding: Vec<f32>) -> FaceRecord {
        FaceRecord {
            bbox: [10.7, 20.2, 110.9, 140.5],
            det_score: 0.9,
            landmark: vec![[30.6, 40.4]; LANDMARK_POINTS],
            embedding,
        }
    }

    #[test]
    fn test_serializes_with_wire_field_names() {
        let json = serde_json::to_value(face(vec![0.5])).unwrap();
        assert!(json.get("normed_embedding").is_some());
        assert!(json.get("embedding").is_none());
        assert_eq!(json["landmark"].as_array().unwrap().len(), LANDMARK_POINTS);
        assert_eq!(json["landmark"][0].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_pixel_bbox_truncates() {
        assert_eq!(face(vec![]).pixel_bbox(), [10, 20, 110, 140]);
        assert_eq!(face(vec![]).landmark_pixels()[0], (30, 40));
    }

    #[test]
    fn test_box_size() {
        let f = face(vec![]);
        assert!((f.width() - 100.2).abs() < 1e-4);
        assert!((f.height() - 120.3).abs() < 1e-4);
    }

    #[test]
    fn test_similarity_identical() {
        let a = face(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&a.clone()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal() {
        let a = face(vec![1.0, 0.0]);
        let b = face(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_opposite() {
        let a = face(vec![1.0, 0.0]);
        let b = face(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_degenerate() {
        assert_eq!(face(vec![0.0, 0.0]).similarity(&face(vec![1.0, 0.0])), 0.0);
        assert_eq!(face(vec![]).similarity(&face(vec![])), 0.0);
        assert_eq!(face(vec![1.0]).similarity(&face(vec![1.0, 0.0])), 0.0);
    }
}
