//! Correlation ids linking a persistence request to its outcome action.

use uuid::Uuid;

/// Generates collision-resistant, time-ordered correlation ids.
///
/// Ids are UUID v7 strings: they sort by creation time, which keeps logs of
/// concurrent requests readable.
///
/// # Examples
///
/// ```
/// use entity_cache::CorrelationIdGenerator;
///
/// let generator = CorrelationIdGenerator::new();
/// let a = generator.next();
/// let b = generator.next();
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationIdGenerator;

impl CorrelationIdGenerator {
    /// Create a generator.
    pub fn new() -> Self {
        Self
    }

    /// A fresh correlation id.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_uuid_v7() {
        let generator = CorrelationIdGenerator::new();
        let ids: Vec<String> = (0..100).map(|_| generator.next()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());

        let parsed = Uuid::parse_str(&ids[0]).unwrap();
        assert_eq!(parsed.get_version_num(), 7);
    }

    #[test]
    fn ids_are_time_ordered() {
        let generator = CorrelationIdGenerator::new();
        let first = generator.next();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = generator.next();
        assert!(first < second);
    }
}
