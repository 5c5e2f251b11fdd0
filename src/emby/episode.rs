//! Episode list reorder (§4.K "Show episodes"), grounded on the original
//! project's `service/emby/episode.go`.

/// Stably reorders `items` so all items at-or-after the first unplayed
/// item precede the played items seen before it, per §4.K:
/// walk once; once the first unplayed item is seen, every subsequent item
/// (played or not) joins the head group unexamined; played items seen
/// before that point are buffered and appended after the head group.
pub fn reorder_unplayed_first<T: Clone>(items: &[T], played: impl Fn(&T) -> bool) -> Vec<T> {
    let mut head = Vec::with_capacity(items.len());
    let mut buffered_played = Vec::new();
    let mut seen_unplayed = false;

    for item in items {
        if seen_unplayed {
            head.push(item.clone());
            continue;
        }
        if played(item) {
            buffered_played.push(item.clone());
        } else {
            seen_unplayed = true;
            head.push(item.clone());
        }
    }

    head.extend(buffered_played);
    head
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_6_reorders_by_first_unplayed_then_append() {
        let played = [true, false, true, false, false, true];
        let indices: Vec<usize> = (0..played.len()).collect();
        let reordered = reorder_unplayed_first(&indices, |i| played[*i]);
        assert_eq!(reordered, vec![1, 2, 3, 4, 5, 0]);
    }

    #[test]
    fn all_unplayed_is_left_unchanged() {
        let played = [false, false, false];
        let indices: Vec<usize> = (0..played.len()).collect();
        let reordered = reorder_unplayed_first(&indices, |i| played[*i]);
        assert_eq!(reordered, vec![0, 1, 2]);
    }

    #[test]
    fn all_played_is_left_unchanged() {
        let played = [true, true, true];
        let indices: Vec<usize> = (0..played.len()).collect();
        let reordered = reorder_unplayed_first(&indices, |i| played[*i]);
        assert_eq!(reordered, vec![0, 1, 2]);
    }

    #[test]
    fn empty_input_reorders_to_empty() {
        let played: [bool; 0] = [];
        let indices: Vec<usize> = Vec::new();
        let reordered = reorder_unplayed_first(&indices, |i: &usize| played[*i]);
        assert!(reordered.is_empty());
    }
}
