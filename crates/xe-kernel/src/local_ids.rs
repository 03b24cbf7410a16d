//! Per-thread local-ID tables.
//!
//! Each hardware thread gets one block holding, for every lane, a `u16` per
//! local-ID channel. Blocks are padded to the GRF size. Work items are
//! numbered so that the first dimension in the walk order varies fastest.

use xe_common::math::align_up;

/// Bytes of local-ID data per hardware thread.
#[must_use]
pub const fn per_thread_data_size(simd: u32, channels: u32, grf_size: usize) -> usize {
    if channels == 0 {
        return 0;
    }
    align_up(simd as usize * channels as usize * 2, grf_size)
}

/// Local IDs of work item `linear` in a group of `group_size`.
#[must_use]
pub fn local_id_of(linear: u32, group_size: [u32; 3], walk_order: [u8; 3]) -> [u32; 3] {
    let [d0, d1, d2] = walk_order.map(usize::from);
    let mut ids = [0u32; 3];
    ids[d0] = linear % group_size[d0];
    ids[d1] = (linear / group_size[d0]) % group_size[d1];
    ids[d2] = linear / (group_size[d0] * group_size[d1]);
    ids
}

/// Fill `out` with the table for one work group, reusing its capacity.
pub fn generate_local_ids(
    out: &mut Vec<u8>,
    group_size: [u32; 3],
    simd: u32,
    channels: u32,
    walk_order: [u8; 3],
    grf_size: usize,
) {
    out.clear();
    let per_thread = per_thread_data_size(simd, channels, grf_size);
    if per_thread == 0 {
        return;
    }
    let items = group_size.iter().product::<u32>();
    let threads = items.div_ceil(simd) as usize;
    out.resize(threads * per_thread, 0);
    let lane_stride = channels as usize * 2;
    for linear in 0..items {
        let ids = local_id_of(linear, group_size, walk_order);
        let thread = (linear / simd) as usize;
        let lane = (linear % simd) as usize;
        let base = thread * per_thread + lane * lane_stride;
        for (channel, id) in ids.iter().take(channels as usize).enumerate() {
            let at = base + channel * 2;
            out[at..at + 2].copy_from_slice(&(*id as u16).to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(table: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([table[offset], table[offset + 1]])
    }

    #[test]
    fn first_walk_dimension_varies_fastest() {
        assert_eq!(local_id_of(5, [4, 2, 1], [0, 1, 2]), [1, 1, 0]);
        assert_eq!(local_id_of(5, [4, 2, 1], [1, 0, 2]), [2, 1, 0]);
    }

    #[test]
    fn table_has_one_triple_per_lane() {
        let mut table = Vec::new();
        generate_local_ids(&mut table, [4, 2, 1], 8, 3, [0, 1, 2], 32);
        // 8 lanes * 3 channels * 2 bytes = 48, padded to 64.
        assert_eq!(table.len(), 64);
        let lane5 = 5 * 6;
        assert_eq!([read(&table, lane5), read(&table, lane5 + 2), read(&table, lane5 + 4)], [1, 1, 0]);
    }

    #[test]
    fn partial_thread_lanes_stay_zero() {
        let mut table = Vec::new();
        generate_local_ids(&mut table, [3, 1, 1], 8, 1, [0, 1, 2], 32);
        assert_eq!(table.len(), 32);
        assert_eq!(read(&table, 4), 2);
        assert!(table[6..].iter().all(|b| *b == 0));
    }

    #[test]
    fn smaller_group_reuses_capacity() {
        let mut table = Vec::new();
        generate_local_ids(&mut table, [64, 4, 1], 16, 3, [0, 1, 2], 32);
        let capacity = table.capacity();
        generate_local_ids(&mut table, [8, 1, 1], 16, 3, [0, 1, 2], 32);
        assert_eq!(table.capacity(), capacity);
        assert_eq!(table.len(), per_thread_data_size(16, 3, 32));
    }

    #[test]
    fn no_channels_means_no_table() {
        let mut table = vec![1, 2, 3];
        generate_local_ids(&mut table, [8, 1, 1], 8, 0, [0, 1, 2], 32);
        assert!(table.is_empty());
    }
}
