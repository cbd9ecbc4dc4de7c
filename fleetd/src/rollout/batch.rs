//! Deterministic batch assignment.
//!
//! Pure function: given a candidate device set and a policy's cumulative
//! staged fractions, assign every device to exactly one batch number so
//! that retries (e.g. after a crash mid-creation) assign identically.

use uuid::Uuid;

/// `fractions` are cumulative, e.g. `[0.10, 0.50, 1.00]`. Devices are
/// sorted by UUID, then sliced at `round(fractions[k] * total)` boundaries.
/// Batch numbers are 1-based.
pub fn assign_batches(devices: &[Uuid], fractions: &[f64]) -> Vec<(Uuid, i32)> {
    if devices.is_empty() || fractions.is_empty() {
        return Vec::new();
    }

    let mut sorted = devices.to_vec();
    sorted.sort();
    let total = sorted.len();

    let mut boundaries: Vec<usize> = fractions
        .iter()
        .map(|f| ((f * total as f64).round() as usize).min(total))
        .collect();
    // Guard against a non-monotonic or short final fraction: the last
    // batch always absorbs every remaining device.
    if let Some(last) = boundaries.last_mut() {
        *last = total;
    }
    for i in 1..boundaries.len() {
        if boundaries[i] < boundaries[i - 1] {
            boundaries[i] = boundaries[i - 1];
        }
    }

    let mut assignments = Vec::with_capacity(total);
    let mut start = 0;
    for (idx, &end) in boundaries.iter().enumerate() {
        let batch_number = (idx + 1) as i32;
        for uuid in &sorted[start..end] {
            assignments.push((*uuid, batch_number));
        }
        start = end;
    }

    assignments
}

/// Number of devices assigned to each batch, in batch order. Used to
/// check the approximate proportionality invariant.
pub fn batch_sizes(assignments: &[(Uuid, i32)]) -> Vec<usize> {
    let Some(&max_batch) = assignments.iter().map(|(_, b)| b).max() else {
        return Vec::new();
    };
    let mut sizes = vec![0usize; max_batch as usize];
    for (_, batch) in assignments {
        sizes[(*batch - 1) as usize] += 1;
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn every_device_gets_exactly_one_batch() {
        let devices = uuids(17);
        let assigned = assign_batches(&devices, &[0.10, 0.50, 1.00]);
        assert_eq!(assigned.len(), devices.len());
    }

    #[test]
    fn batch_sizes_approximate_cumulative_fractions() {
        let devices = uuids(100);
        let assigned = assign_batches(&devices, &[0.10, 0.50, 1.00]);
        let sizes = batch_sizes(&assigned);
        assert_eq!(sizes, vec![10, 40, 50]);
        assert_eq!(sizes.iter().sum::<usize>(), 100);
    }

    #[test]
    fn assignment_is_deterministic_across_calls() {
        let devices = uuids(23);
        let a = assign_batches(&devices, &[0.25, 1.00]);
        let b = assign_batches(&devices, &[0.25, 1.00]);
        assert_eq!(a, b);
    }

    #[test]
    fn assignment_is_independent_of_input_order() {
        let mut devices = uuids(12);
        let a = assign_batches(&devices, &[0.5, 1.0]);
        devices.reverse();
        let b = assign_batches(&devices, &[0.5, 1.0]);
        assert_eq!(a, b);
    }

    #[test]
    fn last_batch_always_absorbs_remainder() {
        let devices = uuids(3);
        // A single fraction under 1.0 should still place every device.
        let assigned = assign_batches(&devices, &[0.10]);
        assert_eq!(assigned.len(), 3);
        assert!(assigned.iter().all(|(_, b)| *b == 1));
    }

    #[test]
    fn empty_device_list_yields_no_assignments() {
        assert!(assign_batches(&[], &[0.5, 1.0]).is_empty());
    }

    #[test]
    fn single_device_single_batch() {
        let devices = uuids(1);
        let assigned = assign_batches(&devices, &[1.0]);
        assert_eq!(assigned, vec![(devices[0], 1)]);
    }
}
