use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use geo::{algorithm::haversine_distance::HaversineDistance, Point};
use serde::{Deserialize, Serialize};

use super::FrameRecord;
use crate::perception::{ColorName, DetectedObject, Shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeBucket {
    Triangle,
    Rectangle,
    Circle,
    Unclassified,
}

impl From<Option<Shape>> for ShapeBucket {
    fn from(shape: Option<Shape>) -> Self {
        match shape {
            Some(Shape::Triangle) => ShapeBucket::Triangle,
            Some(Shape::Rectangle) => ShapeBucket::Rectangle,
            Some(Shape::Circle) => ShapeBucket::Circle,
            None => ShapeBucket::Unclassified,
        }
    }
}

/// A detection together with the frame it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub frame_id: u64,
    pub time: DateTime<Utc>,
    pub object: DetectedObject,
}

pub type ObjectIndex = BTreeMap<ColorName, BTreeMap<ShapeBucket, Vec<Sighting>>>;

/// Groups every journaled detection by color and shape.
pub fn build_index(records: &[FrameRecord]) -> ObjectIndex {
    let mut index = ObjectIndex::new();

    for record in records {
        for object in &record.objects {
            index
                .entry(object.color.clone())
                .or_default()
                .entry(object.shape.into())
                .or_default()
                .push(Sighting {
                    frame_id: record.id,
                    time: record.time,
                    object: object.clone(),
                });
        }
    }

    index
}

/// Detections judged to be one physical object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationCluster {
    pub lat: f64,
    pub lon: f64,
    pub time: Vec<DateTime<Utc>>,
    pub id: Vec<u64>,
}

impl ObservationCluster {
    pub fn point(&self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

pub type ClusterIndex = BTreeMap<ColorName, BTreeMap<ShapeBucket, Vec<ObservationCluster>>>;

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Single-linkage agglomerative clustering cut at `threshold` meters: two
/// points share a cluster when a chain of neighbors closer than the threshold
/// connects them. Clusters are returned in order of their first member.
pub fn single_linkage(points: &[Point<f64>], threshold: f64) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..points.len()).collect();

    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            if points[i].haversine_distance(&points[j]) <= threshold {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[b.max(a)] = a.min(b);
                }
            }
        }
    }

    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..points.len() {
        let root = find(&mut parent, i);
        clusters.entry(root).or_default().push(i);
    }
    clusters.into_values().collect()
}

fn merge(sightings: &[&Sighting], threshold: f64) -> Vec<ObservationCluster> {
    let located: Vec<(&Sighting, Point<f64>)> = sightings
        .iter()
        .filter_map(|s| s.object.geolocation.map(|g| (*s, Point::new(g.lon, g.lat))))
        .collect();
    let points: Vec<_> = located.iter().map(|(_, p)| *p).collect();

    single_linkage(&points, threshold)
        .into_iter()
        .map(|members| {
            let n = members.len() as f64;
            ObservationCluster {
                lat: members.iter().map(|&i| points[i].y()).sum::<f64>() / n,
                lon: members.iter().map(|&i| points[i].x()).sum::<f64>() / n,
                time: members.iter().map(|&i| located[i].0.time).collect(),
                id: members.iter().map(|&i| located[i].0.frame_id).collect(),
            }
        })
        .collect()
}

/// Clusters each (color, shape) group, pooling in the color's unclassified
/// detections. A color that only has unclassified detections is clustered
/// under the unclassified bucket so it is not lost.
pub fn cluster_and_merge(index: &ObjectIndex, threshold: f64) -> ClusterIndex {
    let mut result = ClusterIndex::new();

    for (color, shapes) in index {
        let unclassified: Vec<&Sighting> = shapes
            .get(&ShapeBucket::Unclassified)
            .map(|v| v.iter().collect())
            .unwrap_or_default();

        let mut groups = BTreeMap::new();
        for (bucket, sightings) in shapes.iter().filter(|(b, _)| **b != ShapeBucket::Unclassified) {
            let pooled: Vec<&Sighting> = sightings
                .iter()
                .chain(unclassified.iter().copied())
                .collect();
            groups.insert(*bucket, merge(&pooled, threshold));
        }

        if groups.is_empty() && !unclassified.is_empty() {
            groups.insert(ShapeBucket::Unclassified, merge(&unclassified, threshold));
        }

        groups.retain(|_, clusters| !clusters.is_empty());
        if !groups.is_empty() {
            result.insert(color.clone(), groups);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        geometry::{LocalFrame, PixelPoint},
        perception::{BoundingBox, GeoLocation},
        state::Pose,
    };

    fn sighting_record(id: u64, color: &str, shape: Option<Shape>, at: Point<f64>) -> FrameRecord {
        FrameRecord {
            id,
            time: Utc::now(),
            pose: Pose::default(),
            quality: 100.0,
            raw_image: format!("raw_image_{}.png", id).into(),
            computed_image: None,
            objects: vec![DetectedObject {
                color: color.into(),
                shape,
                center: PixelPoint::default(),
                contour: Vec::new(),
                bbox: BoundingBox::default(),
                local_id: 0,
                geolocation: Some(GeoLocation {
                    lat: at.y(),
                    lon: at.x(),
                }),
                code_corners: None,
            }],
        }
    }

    #[test]
    fn nearby_detections_merge_into_one_cluster() {
        let frame = LocalFrame::new(48.0, 11.0);
        let records = vec![
            sighting_record(0, "red", Some(Shape::Triangle), frame.to_global(0.0, 0.0)),
            sighting_record(1, "red", Some(Shape::Triangle), frame.to_global(2.0, 1.0)),
        ];

        let clusters = cluster_and_merge(&build_index(&records), 5.0);
        let triangles = &clusters[&ColorName::from("red")][&ShapeBucket::Triangle];

        assert_eq!(triangles.len(), 1);
        assert_eq!(triangles[0].id, vec![0, 1]);
        let (n, e) = frame.to_local(triangles[0].point());
        assert!((n - 1.0).abs() < 1e-3 && (e - 0.5).abs() < 1e-3, "{} {}", n, e);
    }

    #[test]
    fn distant_detections_stay_apart() {
        let frame = LocalFrame::new(48.0, 11.0);
        let records = vec![
            sighting_record(0, "red", Some(Shape::Triangle), frame.to_global(0.0, 0.0)),
            sighting_record(1, "red", Some(Shape::Triangle), frame.to_global(20.0, 0.0)),
        ];

        let clusters = cluster_and_merge(&build_index(&records), 5.0);
        assert_eq!(clusters[&ColorName::from("red")][&ShapeBucket::Triangle].len(), 2);
    }

    #[test]
    fn chains_link_through_intermediate_points() {
        let frame = LocalFrame::new(0.0, 0.0);
        let points: Vec<_> = [0.0, 4.0, 8.0, 30.0]
            .iter()
            .map(|n| frame.to_global(*n, 0.0))
            .collect();

        assert_eq!(single_linkage(&points, 5.0), vec![vec![0, 1, 2], vec![3]]);
    }

    #[test]
    fn unclassified_detections_join_each_shape_group() {
        let frame = LocalFrame::new(48.0, 11.0);
        let records = vec![
            sighting_record(0, "blue", Some(Shape::Circle), frame.to_global(0.0, 0.0)),
            sighting_record(1, "blue", None, frame.to_global(1.0, 0.0)),
            sighting_record(2, "green", None, frame.to_global(50.0, 0.0)),
        ];

        let index = build_index(&records);
        assert_eq!(index[&ColorName::from("blue")].len(), 2);

        let clusters = cluster_and_merge(&index, 5.0);
        let blue = &clusters[&ColorName::from("blue")];
        assert_eq!(blue.len(), 1);
        assert_eq!(blue[&ShapeBucket::Circle][0].id, vec![0, 1]);

        let green = &clusters[&ColorName::from("green")];
        assert_eq!(green[&ShapeBucket::Unclassified].len(), 1);
    }

    #[test]
    fn filtered_results_serialize_by_name() {
        let frame = LocalFrame::new(48.0, 11.0);
        let records = vec![sighting_record(
            3,
            "red",
            Some(Shape::Rectangle),
            frame.to_global(0.0, 0.0),
        )];

        let value = serde_json::to_value(cluster_and_merge(&build_index(&records), 5.0)).unwrap();
        assert_eq!(value["red"]["rectangle"][0]["id"][0], 3);
        assert_eq!(value["red"]["rectangle"][0]["lat"], 48.0);
    }
}
