// ── Object status ──
//
// Severity ordering and the compound-status roll-up. The roll-up is a
// plain function of its inputs; callers recompute it from scratch
// every time anything changes.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Health of a node or one of its children, least to most severe,
/// followed by the non-severity states.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ObjectStatus {
    Normal,
    Warning,
    Minor,
    Major,
    Critical,
    #[default]
    Unknown,
    Unmanaged,
    Disabled,
}

impl ObjectStatus {
    /// Statuses that count a child as "down" when deciding whether the
    /// whole node is unreachable.
    pub fn counts_as_down(self) -> bool {
        matches!(
            self,
            Self::Critical | Self::Unknown | Self::Unmanaged | Self::Disabled
        )
    }

    /// `true` for Normal through Critical.
    pub fn is_severity(self) -> bool {
        self <= Self::Critical
    }
}

/// How child statuses are folded into the node status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
pub enum StatusAlgorithm {
    /// The worst child wins.
    #[default]
    MostCritical,
    /// The worst severity held (at or above) by at least `percent` of
    /// the children wins; below that the node is Normal.
    SingleThreshold { percent: u8 },
}

/// Roll up child statuses into the node status.
///
/// Unmanaged nodes are always Unmanaged; unreachable ones are always
/// Critical. Otherwise only children with a real severity take part,
/// and a node without any is Unknown.
pub fn compound_status(
    algorithm: StatusAlgorithm,
    children: &[ObjectStatus],
    managed: bool,
    unreachable: bool,
) -> ObjectStatus {
    if !managed {
        return ObjectStatus::Unmanaged;
    }
    if unreachable {
        return ObjectStatus::Critical;
    }

    let rated: Vec<ObjectStatus> = children.iter().copied().filter(|s| s.is_severity()).collect();
    if rated.is_empty() {
        return ObjectStatus::Unknown;
    }

    match algorithm {
        StatusAlgorithm::MostCritical => rated.iter().copied().max().unwrap_or(ObjectStatus::Unknown),
        StatusAlgorithm::SingleThreshold { percent } => {
            let total = rated.len();
            [
                ObjectStatus::Critical,
                ObjectStatus::Major,
                ObjectStatus::Minor,
                ObjectStatus::Warning,
            ]
            .into_iter()
            .find(|&level| {
                let at_or_above = rated.iter().filter(|&&s| s >= level).count();
                at_or_above * 100 >= total * usize::from(percent)
            })
            .unwrap_or(ObjectStatus::Normal)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use ObjectStatus::{Critical, Disabled, Major, Minor, Normal, Unknown, Unmanaged, Warning};

    #[test]
    fn most_critical_picks_worst_rated_child() {
        let children = [Normal, Minor, Unknown, Warning, Disabled];
        assert_eq!(
            compound_status(StatusAlgorithm::MostCritical, &children, true, false),
            Minor
        );
    }

    #[test]
    fn no_rated_children_is_unknown() {
        assert_eq!(
            compound_status(StatusAlgorithm::MostCritical, &[Unknown, Unmanaged], true, false),
            Unknown
        );
        assert_eq!(compound_status(StatusAlgorithm::MostCritical, &[], true, false), Unknown);
    }

    #[test]
    fn unreachable_and_unmanaged_override_children() {
        assert_eq!(
            compound_status(StatusAlgorithm::MostCritical, &[Normal], true, true),
            Critical
        );
        assert_eq!(
            compound_status(StatusAlgorithm::MostCritical, &[Normal], false, true),
            Unmanaged
        );
    }

    #[test]
    fn recomputation_has_no_hidden_state() {
        let children = [Major, Normal, Critical, Unknown];
        let first = compound_status(StatusAlgorithm::MostCritical, &children, true, false);
        let second = compound_status(StatusAlgorithm::MostCritical, &children, true, false);
        assert_eq!(first, second);
    }

    #[test]
    fn single_threshold_needs_enough_children() {
        let algorithm = StatusAlgorithm::SingleThreshold { percent: 50 };
        assert_eq!(compound_status(algorithm, &[Critical, Normal, Normal, Normal], true, false), Normal);
        assert_eq!(compound_status(algorithm, &[Critical, Major, Normal, Normal], true, false), Major);
    }

    #[test]
    fn down_classification() {
        assert!(Critical.counts_as_down());
        assert!(Disabled.counts_as_down());
        assert!(!Major.counts_as_down());
    }

    #[test]
    fn algorithm_deserializes_from_tagged_table() {
        let parsed: StatusAlgorithm =
            serde_json::from_str(r#"{"algorithm":"single-threshold","percent":75}"#).unwrap();
        assert_eq!(parsed, StatusAlgorithm::SingleThreshold { percent: 75 });
    }
}
