//! Cluster Builder
//!
//! Groups a batch's photos into ordered clusters of temporal and spatial
//! proximity. One linear scan over photos sorted by capture time: a new
//! cluster starts whenever the gap to the previous photo exceeds a threshold
//! in any dimension both photos share. Photos with neither timestamp nor GPS
//! go to the designated unclustered group.
//!
//! Synchronous and pure: identical inputs always give identical clusters.

use crate::types::{
    Centroid, Cluster, ClusterId, ClusterKind, GpsCoordinate, Photo, TaggingError,
    TaggingResult,
};
use chrono::{Duration as ChronoDuration, NaiveDateTime};

/// Mean Earth radius (IUGG)
const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Split thresholds between neighbouring photos
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterThresholds {
    pub max_time_gap_hours: f64,
    pub max_distance_km: f64,
}

impl ClusterThresholds {
    /// Validated thresholds; both must be positive and finite
    pub fn new(max_time_gap_hours: f64, max_distance_km: f64) -> TaggingResult<Self> {
        if !(max_time_gap_hours.is_finite() && max_time_gap_hours > 0.0) {
            return Err(TaggingError::Configuration(format!(
                "Cluster time gap must be positive and finite, got {}",
                max_time_gap_hours
            )));
        }
        if !(max_distance_km.is_finite() && max_distance_km > 0.0) {
            return Err(TaggingError::Configuration(format!(
                "Cluster distance must be positive and finite, got {}",
                max_distance_km
            )));
        }
        Ok(Self {
            max_time_gap_hours,
            max_distance_km,
        })
    }
}

impl Default for ClusterThresholds {
    fn default() -> Self {
        Self {
            max_time_gap_hours: 6.0,
            max_distance_km: 5.0,
        }
    }
}

/// Cluster Builder
pub struct ClusterBuilder {
    thresholds: ClusterThresholds,
}

impl ClusterBuilder {
    pub fn new(thresholds: ClusterThresholds) -> Self {
        Self { thresholds }
    }

    /// Partition photos into clusters
    ///
    /// Every photo lands in exactly one cluster. Proximity clusters come
    /// first in capture order; the unclustered group (if any) is last.
    ///
    /// # Arguments
    /// * `photos` - Normalized photos of one batch
    ///
    /// # Returns
    /// Clusters with sequential ids (`cluster-001`, ...) and centroids
    pub fn build(&self, photos: &[Photo]) -> Vec<Cluster> {
        let (mut located, unlocated): (Vec<&Photo>, Vec<&Photo>) = photos
            .iter()
            .partition(|p| p.captured_at().is_some() || p.gps().is_some());

        // Stable: untimed photos keep input order, after timed ones
        located.sort_by(|a, b| match (a.captured_at(), b.captured_at()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        let mut groups: Vec<Vec<&Photo>> = Vec::new();
        for photo in located {
            match groups.last_mut() {
                Some(current) if !self.splits(current[current.len() - 1], photo) => {
                    current.push(photo)
                }
                _ => groups.push(vec![photo]),
            }
        }

        let mut clusters: Vec<Cluster> = groups
            .into_iter()
            .enumerate()
            .map(|(index, members)| Cluster {
                id: ClusterId::numbered(index + 1),
                kind: ClusterKind::Proximity,
                centroid: centroid(&members),
                photo_ids: members.iter().map(|p| p.id.clone()).collect(),
            })
            .collect();

        if !unlocated.is_empty() {
            clusters.push(Cluster {
                id: ClusterId::unclustered(),
                kind: ClusterKind::Unclustered,
                centroid: Centroid::default(),
                photo_ids: unlocated.iter().map(|p| p.id.clone()).collect(),
            });
        }

        tracing::debug!(
            photos = photos.len(),
            clusters = clusters.len(),
            unclustered = unlocated.len(),
            "Clusters built"
        );

        clusters
    }

    /// True if `next` must start a new cluster after `prev`
    ///
    /// Neighbours sharing no dimension are never merged.
    fn splits(&self, prev: &Photo, next: &Photo) -> bool {
        let time_gap = match (prev.captured_at(), next.captured_at()) {
            (Some(a), Some(b)) => Some(hours_between(a, b)),
            _ => None,
        };
        let distance = match (prev.gps(), next.gps()) {
            (Some(a), Some(b)) => Some(haversine_km(a, b)),
            _ => None,
        };

        if time_gap.is_none() && distance.is_none() {
            return true;
        }

        time_gap.is_some_and(|h| h > self.thresholds.max_time_gap_hours)
            || distance.is_some_and(|d| d > self.thresholds.max_distance_km)
    }
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new(ClusterThresholds::default())
    }
}

fn hours_between(a: NaiveDateTime, b: NaiveDateTime) -> f64 {
    (b - a).num_seconds().abs() as f64 / 3600.0
}

/// Great-circle distance in kilometres
pub fn haversine_km(a: GpsCoordinate, b: GpsCoordinate) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Mean capture time and mean position of the members that have them
fn centroid(members: &[&Photo]) -> Centroid {
    let times: Vec<NaiveDateTime> = members.iter().filter_map(|p| p.captured_at()).collect();
    let timestamp = times.first().map(|&base| {
        let offset_sum: i64 = times.iter().map(|t| (*t - base).num_seconds()).sum();
        base + ChronoDuration::seconds(offset_sum / times.len() as i64)
    });

    let points: Vec<GpsCoordinate> = members.iter().filter_map(|p| p.gps()).collect();
    let gps = if points.is_empty() {
        None
    } else {
        let n = points.len() as f64;
        Some(GpsCoordinate::new(
            points.iter().map(|p| p.latitude).sum::<f64>() / n,
            points.iter().map(|p| p.longitude).sum::<f64>() / n,
        ))
    };

    Centroid { timestamp, gps }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PhotoId, PhotoMetadata};
    use chrono::NaiveDate;
    use std::path::PathBuf;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 15)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            + ChronoDuration::hours(hour as i64)
    }

    fn photo(id: &str, time: Option<NaiveDateTime>, gps: Option<(f64, f64)>) -> Photo {
        Photo {
            id: PhotoId::new(id),
            path: PathBuf::from(format!("/photos/{}.jpg", id)),
            metadata: PhotoMetadata {
                captured_at: time,
                gps: gps.map(|(lat, lon)| GpsCoordinate::new(lat, lon)),
                camera: None,
                lens: None,
            },
            existing_tags: vec![],
        }
    }

    const ROUEN: (f64, f64) = (49.4404, 1.0939);
    const ROUEN_NEARBY: (f64, f64) = (49.4431, 1.0993);
    const PARIS: (f64, f64) = (48.8584, 2.2945);

    fn ids(cluster: &Cluster) -> Vec<&str> {
        cluster.photo_ids.iter().map(|id| id.as_str()).collect()
    }

    #[test]
    fn test_time_gap_splits_clusters() {
        let builder = ClusterBuilder::default();
        let photos = vec![
            photo("a", Some(at(0)), Some(ROUEN)),
            photo("b", Some(at(3)), Some(ROUEN_NEARBY)),
            photo("c", Some(at(13)), Some(ROUEN)),
        ];

        let clusters = builder.build(&photos);
        assert_eq!(clusters.len(), 2);
        assert_eq!(ids(&clusters[0]), vec!["a", "b"]);
        assert_eq!(ids(&clusters[1]), vec!["c"]);
        assert_eq!(clusters[0].id.as_str(), "cluster-001");
        assert_eq!(clusters[1].id.as_str(), "cluster-002");
    }

    #[test]
    fn test_distance_splits_clusters() {
        let builder = ClusterBuilder::default();
        let photos = vec![
            photo("a", Some(at(0)), Some(ROUEN)),
            photo("b", Some(at(1)), Some(PARIS)),
        ];
        assert_eq!(builder.build(&photos).len(), 2);
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let builder = ClusterBuilder::default();
        let photos = vec![
            photo("c", Some(at(13)), Some(ROUEN)),
            photo("b", Some(at(3)), Some(ROUEN_NEARBY)),
            photo("a", Some(at(0)), Some(ROUEN)),
        ];
        let clusters = builder.build(&photos);
        assert_eq!(ids(&clusters[0]), vec!["a", "b"]);
    }

    #[test]
    fn test_photos_without_time_or_gps_are_unclustered() {
        let builder = ClusterBuilder::default();
        let photos = vec![
            photo("x", None, None),
            photo("a", Some(at(0)), None),
            photo("y", None, None),
        ];

        let clusters = builder.build(&photos);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[1].kind, ClusterKind::Unclustered);
        assert_eq!(clusters[1].id.as_str(), "unclustered");
        assert_eq!(ids(&clusters[1]), vec!["x", "y"]);
        assert!(!clusters[1].wants_group_analysis());
    }

    #[test]
    fn test_gps_only_photos_cluster_by_distance() {
        let builder = ClusterBuilder::default();
        let photos = vec![
            photo("a", None, Some(ROUEN)),
            photo("b", None, Some(ROUEN_NEARBY)),
            photo("c", None, Some(PARIS)),
        ];
        let clusters = builder.build(&photos);
        assert_eq!(clusters.len(), 2);
        assert_eq!(ids(&clusters[0]), vec!["a", "b"]);
    }

    #[test]
    fn test_no_shared_dimension_splits() {
        let builder = ClusterBuilder::default();
        let photos = vec![photo("a", Some(at(0)), None), photo("b", None, Some(ROUEN))];
        assert_eq!(builder.build(&photos).len(), 2);
    }

    #[test]
    fn test_every_photo_in_exactly_one_cluster() {
        let builder = ClusterBuilder::default();
        let photos = vec![
            photo("a", Some(at(0)), Some(ROUEN)),
            photo("b", None, None),
            photo("c", Some(at(20)), None),
            photo("d", None, Some(PARIS)),
            photo("e", Some(at(1)), Some(ROUEN_NEARBY)),
        ];
        let clusters = builder.build(&photos);

        let mut all: Vec<&str> = clusters.iter().flat_map(ids).collect();
        all.sort();
        assert_eq!(all, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_centroid() {
        let builder = ClusterBuilder::default();
        let photos = vec![
            photo("a", Some(at(0)), Some((49.0, 1.0))),
            photo("b", Some(at(2)), Some((49.02, 1.02))),
        ];
        let clusters = builder.build(&photos);
        let centroid = &clusters[0].centroid;
        assert_eq!(centroid.timestamp, Some(at(1)));
        let gps = centroid.gps.unwrap();
        assert!((gps.latitude - 49.01).abs() < 1e-9);
        assert!((gps.longitude - 1.01).abs() < 1e-9);
    }

    #[test]
    fn test_empty_batch() {
        assert!(ClusterBuilder::default().build(&[]).is_empty());
    }

    #[test]
    fn test_threshold_validation() {
        assert!(ClusterThresholds::new(6.0, 5.0).is_ok());
        assert!(ClusterThresholds::new(0.0, 5.0).is_err());
        assert!(ClusterThresholds::new(6.0, -1.0).is_err());
        assert!(ClusterThresholds::new(f64::INFINITY, 5.0).is_err());
        assert!(ClusterThresholds::new(6.0, f64::NAN).is_err());
    }

    #[test]
    fn test_haversine() {
        let rouen = GpsCoordinate::new(ROUEN.0, ROUEN.1);
        let paris = GpsCoordinate::new(PARIS.0, PARIS.1);
        let d = haversine_km(rouen, paris);
        assert!(d > 100.0 && d < 120.0, "Rouen-Paris is ~110 km, got {}", d);
        assert_eq!(haversine_km(rouen, rouen), 0.0);
    }
}
