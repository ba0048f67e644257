/// Split `[from_block, to_block]` into inclusive sub-ranges of at most `step` blocks.
///
/// Ascending when `from_block <= to_block`, descending otherwise; in both
/// directions the sub-ranges are contiguous and the last one ends at `to_block`.
pub fn get_batch_block_range(from_block: u64, to_block: u64, step: u64) -> Vec<(u64, u64)> {
    let step = step.max(1);
    let mut ranges = Vec::new();
    let mut current = from_block;

    if from_block <= to_block {
        loop {
            let batch_end = current.saturating_add(step - 1).min(to_block);
            ranges.push((current, batch_end));
            if batch_end == to_block {
                break;
            }
            current = batch_end + 1;
        }
    } else {
        loop {
            let batch_end = current.saturating_sub(step - 1).max(to_block);
            ranges.push((current, batch_end));
            if batch_end == to_block {
                break;
            }
            current = batch_end - 1;
        }
    }

    ranges
}
