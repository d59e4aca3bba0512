//! Polygon annotations and their rasterization into per-class masks.

use std::path::Path;

use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;
use serde::{Deserialize, Serialize};
use xray_core::{ClassMap, Error, Result};

/// Mask value of a pixel inside a bone
pub const FOREGROUND: u8 = 1;

/// One labelled polygon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub label: String,
    /// Vertices as `[x, y]` pixel coordinates
    pub points: Vec<[f64; 2]>,
}

/// Contents of one annotation file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationFile {
    pub annotations: Vec<Annotation>,
}

impl AnnotationFile {
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json).map_err(|e| Error::Annotation {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// One `width × height` mask per class, [`FOREGROUND`] inside polygons.
    ///
    /// Labels outside `classes` and polygons with fewer than three distinct
    /// vertices are skipped.
    pub fn rasterize(&self, classes: &ClassMap, width: u32, height: u32) -> Vec<GrayImage> {
        let mut masks = vec![GrayImage::new(width, height); classes.len()];

        for annotation in &self.annotations {
            let Some(class) = classes.index_of(&annotation.label) else {
                tracing::trace!(label = %annotation.label, "Skipping unknown label");
                continue;
            };
            let Some(polygon) = polygon_vertices(&annotation.points) else {
                tracing::debug!(label = %annotation.label, "Skipping degenerate polygon");
                continue;
            };
            draw_polygon_mut(&mut masks[class], &polygon, Luma([FOREGROUND]));
        }

        masks
    }
}

/// Integer vertices with repeats removed and the ring left open
fn polygon_vertices(points: &[[f64; 2]]) -> Option<Vec<Point<i32>>> {
    let mut vertices: Vec<Point<i32>> = Vec::with_capacity(points.len());
    for &[x, y] in points {
        let p = Point::new(x.round() as i32, y.round() as i32);
        if vertices.last() != Some(&p) {
            vertices.push(p);
        }
    }
    while vertices.len() > 1 && vertices.first() == vertices.last() {
        vertices.pop();
    }

    let mut distinct = vertices.clone();
    distinct.sort_by_key(|p| (p.x, p.y));
    distinct.dedup();

    (distinct.len() >= 3).then_some(vertices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(label: &str) -> Annotation {
        Annotation {
            label: label.to_string(),
            points: vec![[2.0, 2.0], [7.0, 2.0], [7.0, 7.0], [2.0, 7.0]],
        }
    }

    fn count(mask: &GrayImage) -> usize {
        mask.pixels().filter(|p| p.0[0] == FOREGROUND).count()
    }

    #[test]
    fn test_parse_annotation_json() {
        let json = r#"{"annotations": [{"label": "Radius", "points": [[1, 2], [3, 4], [5, 1]], "id": "x"}]}"#;
        let file = AnnotationFile::from_json(json).unwrap();
        assert_eq!(file.annotations.len(), 1);
        assert_eq!(file.annotations[0].points[1], [3.0, 4.0]);
    }

    #[test]
    fn test_rasterize_fills_class_channel() {
        let classes = ClassMap::hand_bones();
        let file = AnnotationFile {
            annotations: vec![square("Lunate")],
        };

        let masks = file.rasterize(&classes, 10, 10);
        assert_eq!(masks.len(), 29);

        let lunate = classes.index_of("Lunate").unwrap();
        for (x, y, p) in masks[lunate].enumerate_pixels() {
            let inside = (3..=6).contains(&x) && (3..=6).contains(&y);
            let outside = !(2..=7).contains(&x) || !(2..=7).contains(&y);
            if inside {
                assert_eq!(p.0[0], FOREGROUND, "({x}, {y}) not filled");
            }
            if outside {
                assert_eq!(p.0[0], 0, "({x}, {y}) filled");
            }
        }
        assert!(masks
            .iter()
            .enumerate()
            .all(|(i, m)| i == lunate || count(m) == 0));
    }

    #[test]
    fn test_unknown_and_degenerate_polygons_are_skipped() {
        let classes = ClassMap::hand_bones();
        let line = Annotation {
            label: "Ulna".to_string(),
            points: vec![[1.0, 1.0], [5.0, 5.0], [1.0, 1.0]],
        };
        let file = AnnotationFile {
            annotations: vec![square("finger-42"), line],
        };

        let masks = file.rasterize(&classes, 10, 10);
        assert!(masks.iter().all(|m| count(m) == 0));
    }

    #[test]
    fn test_closed_ring_is_accepted() {
        let mut closed = square("Radius");
        closed.points.push([2.0, 2.0]);
        let vertices = polygon_vertices(&closed.points).unwrap();
        assert_eq!(vertices.len(), 4);
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{\"annotations\": 3}").unwrap();

        let err = AnnotationFile::load(&path).unwrap_err();
        assert!(matches!(err, Error::Annotation { .. }));
    }
}
