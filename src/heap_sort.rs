//! In-place heap sort.
//!
//! Bottom-up heapify followed by repeated extraction of the max. The order
//! is fully determined by the comparator, so callers that need a total order
//! over equal keys break ties inside the comparator.

use std::cmp::Ordering;

pub fn heap_sort<T: Ord>(items: &mut [T]) {
    heap_sort_by(items, |a, b| a.cmp(b));
}

pub fn heap_sort_by<T, F>(items: &mut [T], cmp: F)
where
    F: Fn(&T, &T) -> Ordering,
{
    let len = items.len();
    if len < 2 {
        return;
    }

    for start in (0..len / 2).rev() {
        sift_down(items, start, len, &cmp);
    }

    for end in (1..len).rev() {
        items.swap(0, end);
        sift_down(items, 0, end, &cmp);
    }
}

/// Restore the max-heap property for the subtree at `root` within `items[..end]`.
fn sift_down<T, F>(items: &mut [T], mut root: usize, end: usize, cmp: &F)
where
    F: Fn(&T, &T) -> Ordering,
{
    loop {
        let left = 2 * root + 1;
        if left >= end {
            break;
        }
        let right = left + 1;
        let mut largest = root;

        if cmp(&items[left], &items[largest]) == Ordering::Greater {
            largest = left;
        }
        if right < end && cmp(&items[right], &items[largest]) == Ordering::Greater {
            largest = right;
        }
        if largest == root {
            break;
        }
        items.swap(root, largest);
        root = largest;
    }
}
