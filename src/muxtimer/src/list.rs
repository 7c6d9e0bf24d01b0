//! Sorted intrusive singly-linked lists of [`TimerEntry`]s
//!
//! [`TimerEntry`]: crate::TimerEntry
use crate::{
    entry::{Link, ListKind, TimerRef},
    klock::{CpuLockCell, CpuLockTokenRefMut},
    port::PortCpuLock,
};

/// The head pointer of a list.
pub(crate) type ListHead<P> = CpuLockCell<P, Option<TimerRef<P>>>;

/// Get a flag indicating whether `a` should stay in front of `b` in a list of
/// the specified kind. Entries that compare equal keep their insertion order.
#[inline]
fn precedes_or_ties<P>(kind: ListKind, a: &Link<P>, b: &Link<P>) -> bool {
    match kind {
        ListKind::Current | ListKind::Overflow => a.target <= b.target,
        ListKind::Long => (a.long_target, a.target) <= (b.long_target, b.target),
    }
}

/// Link `timer` into `head` after every entry that doesn't expire later.
/// Returns `true` if `timer` became the new head.
pub(crate) fn insert<P: PortCpuLock>(
    mut lock: CpuLockTokenRefMut<'_, P>,
    head: &ListHead<P>,
    kind: ListKind,
    timer: TimerRef<P>,
    target: u32,
    long_target: u32,
) -> bool {
    // This check is important for memory safety. If `timer` ended up in two
    // places, unlinking one of them would flag the entry as unlinked, and
    // dropping it then would leave the other one dangling.
    assert!(
        timer.link(lock.borrow_mut()).list.is_none(),
        "timer is already linked"
    );

    let new_link = Link {
        next: None,
        target,
        long_target,
        list: Some(kind),
    };

    let mut prev = None;
    let mut cursor = head.get(&*lock);
    while let Some(entry) = cursor {
        let link = entry.link(lock.borrow_mut());
        if !precedes_or_ties(kind, &link, &new_link) {
            break;
        }
        prev = Some(entry);
        cursor = link.next;
    }

    timer.set_link(
        lock.borrow_mut(),
        Link {
            next: cursor,
            ..new_link
        },
    );

    if let Some(prev) = prev {
        prev.set_next(lock.borrow_mut(), Some(timer));
        false
    } else {
        head.replace(&mut *lock, Some(timer));
        true
    }
}

/// Unlink `timer` from `head`. Returns `false` if it wasn't found.
pub(crate) fn unlink<P: PortCpuLock>(
    mut lock: CpuLockTokenRefMut<'_, P>,
    head: &ListHead<P>,
    timer: TimerRef<P>,
) -> bool {
    let mut prev: Option<TimerRef<P>> = None;
    let mut cursor = head.get(&*lock);
    while let Some(entry) = cursor {
        let next = entry.next(lock.borrow_mut());
        if entry == timer {
            if let Some(prev) = prev {
                prev.set_next(lock.borrow_mut(), next);
            } else {
                head.replace(&mut *lock, next);
            }
            mark_unlinked(lock, timer);
            return true;
        }
        prev = Some(entry);
        cursor = next;
    }
    false
}

/// Unlink and return the first entry of `head`.
pub(crate) fn pop_front<P: PortCpuLock>(
    mut lock: CpuLockTokenRefMut<'_, P>,
    head: &ListHead<P>,
) -> Option<TimerRef<P>> {
    let first = head.get(&*lock)?;
    let next = first.next(lock.borrow_mut());
    head.replace(&mut *lock, next);
    mark_unlinked(lock, first);
    Some(first)
}

fn mark_unlinked<P: PortCpuLock>(mut lock: CpuLockTokenRefMut<'_, P>, timer: TimerRef<P>) {
    let link = timer.link(lock.borrow_mut());
    timer.set_link(
        lock,
        Link {
            next: None,
            list: None,
            ..link
        },
    );
}

/// Detach the longest prefix of `head` whose entries satisfy `pred` and
/// return it as a new chain, retagged as `new_kind`.
pub(crate) fn take_prefix<P: PortCpuLock>(
    mut lock: CpuLockTokenRefMut<'_, P>,
    head: &ListHead<P>,
    new_kind: ListKind,
    mut pred: impl FnMut(&Link<P>) -> bool,
) -> Option<TimerRef<P>> {
    let first = head.get(&*lock);
    let mut last = None;
    let mut cursor = first;
    while let Some(entry) = cursor {
        let link = entry.link(lock.borrow_mut());
        if !pred(&link) {
            break;
        }
        entry.set_link(
            lock.borrow_mut(),
            Link {
                list: Some(new_kind),
                ..link
            },
        );
        last = Some(entry);
        cursor = link.next;
    }

    let last = last?;
    last.set_next(lock.borrow_mut(), None);
    head.replace(&mut *lock, cursor);
    first
}

/// Retag every entry of the chain starting at `first` as `new_kind`.
pub(crate) fn retag<P: PortCpuLock>(
    mut lock: CpuLockTokenRefMut<'_, P>,
    first: Option<TimerRef<P>>,
    new_kind: ListKind,
) {
    let mut cursor = first;
    while let Some(entry) = cursor {
        let link = entry.link(lock.borrow_mut());
        entry.set_link(
            lock.borrow_mut(),
            Link {
                list: Some(new_kind),
                ..link
            },
        );
        cursor = link.next;
    }
}

/// Merge two chains sorted by `target` into one. On ties, entries from `a`
/// go first.
pub(crate) fn merge<P: PortCpuLock>(
    mut lock: CpuLockTokenRefMut<'_, P>,
    mut a: Option<TimerRef<P>>,
    mut b: Option<TimerRef<P>>,
) -> Option<TimerRef<P>> {
    let mut merged = None;
    let mut tail: Option<TimerRef<P>> = None;

    loop {
        let picked = match (a, b) {
            (Some(x), Some(y)) => {
                if x.target(lock.borrow_mut()) <= y.target(lock.borrow_mut()) {
                    a = x.next(lock.borrow_mut());
                    x
                } else {
                    b = y.next(lock.borrow_mut());
                    y
                }
            }
            // The rest is already terminated
            (Some(rest), None) | (None, Some(rest)) => {
                a = None;
                b = None;
                rest
            }
            (None, None) => break,
        };

        if let Some(tail) = tail {
            tail.set_next(lock.borrow_mut(), Some(picked));
        } else {
            merged = Some(picked);
        }
        tail = Some(picked);
    }

    merged
}

/// Check that the list is sorted and every entry is tagged with `kind`.
/// Returns the number of entries.
#[cfg(debug_assertions)]
pub(crate) fn validate<P: PortCpuLock>(
    mut lock: CpuLockTokenRefMut<'_, P>,
    head: &ListHead<P>,
    kind: ListKind,
) -> usize {
    let mut count = 0;
    let mut prev: Option<Link<P>> = None;
    let mut cursor = head.get(&*lock);
    while let Some(entry) = cursor {
        let link = entry.link(lock.borrow_mut());
        assert_eq!(link.list, Some(kind), "entry is tagged with a wrong list");
        if let Some(prev) = &prev {
            assert!(
                precedes_or_ties(kind, prev, &link),
                "{kind:?} list is out of order"
            );
        }
        count += 1;
        prev = Some(link);
        cursor = link.next;
    }
    count
}

#[cfg(test)]
mod tests;
