use quickcheck_macros::quickcheck;
use std::pin::Pin;

use super::*;
use crate::{entry::TimerEntry, klock::lock_cpu, sim::Sim32};

const NUM_ENTRIES: usize = 8;

/// A modifying operation on a pair of lists `a` and `b`.
#[derive(Debug)]
enum Cmd {
    /// Insert entry `.0` into `a` with target `.1`.
    InsertA(usize, u32),
    /// Insert entry `.0` into `b` with target `.1`.
    InsertB(usize, u32),
    /// Unlink entry `.0` from whichever list it's in.
    Unlink(usize),
    PopA,
    /// Move the entries of `a` expiring at or before `.0` to `b`.
    MoveDue(u32),
    /// Move all entries of `b` to `a`.
    Drain,
}

/// Map random bytes to operations on the lists. Targets are drawn from a
/// small range so that ties are common.
fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
    let mut i = 0;
    std::iter::from_fn(move || {
        let instr = bytecode.get(i..i + 3)?;
        i += 3;

        let entry = instr[1] as usize % NUM_ENTRIES;
        let target = instr[2] as u32 % 16;

        Some(match instr[0] % 8 {
            0 | 1 => Cmd::InsertA(entry, target),
            2 | 3 => Cmd::InsertB(entry, target),
            4 => Cmd::Unlink(entry),
            5 => Cmd::PopA,
            6 => Cmd::MoveDue(target),
            _ => Cmd::Drain,
        })
    })
}

/// Stable merge, `x` first on ties.
fn merge_model(x: Vec<(usize, u32)>, y: Vec<(usize, u32)>) -> Vec<(usize, u32)> {
    let mut out = Vec::with_capacity(x.len() + y.len());
    let (mut x, mut y) = (x.into_iter().peekable(), y.into_iter().peekable());
    loop {
        match (x.peek().map(|e| e.1), y.peek().map(|e| e.1)) {
            (Some(a), Some(b)) if a <= b => out.extend(x.next()),
            (Some(_), Some(_)) => out.extend(y.next()),
            (Some(_), None) => out.extend(x.next()),
            (None, Some(_)) => out.extend(y.next()),
            (None, None) => return out,
        }
    }
}

fn insert_model(list: &mut Vec<(usize, u32)>, entry: usize, target: u32) {
    let i = list.iter().take_while(|&&(_, t)| t <= target).count();
    list.insert(i, (entry, target));
}

fn test_inner(bytecode: Vec<u8>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let port = Sim32::new(0);
    let entries: Vec<Pin<Box<TimerEntry<Sim32>>>> =
        (0..NUM_ENTRIES).map(|_| Box::pin(TimerEntry::new())).collect();
    // Safety: The entries are pinned
    let refs: Vec<TimerRef<Sim32>> = entries
        .iter()
        .map(|e| unsafe { TimerRef::new(&**e) })
        .collect();
    let id_of = |r: TimerRef<Sim32>| refs.iter().position(|&x| x == r).unwrap();

    let a: ListHead<Sim32> = CpuLockCell::new(None);
    let b: ListHead<Sim32> = CpuLockCell::new(None);
    let mut ref_a: Vec<(usize, u32)> = Vec::new();
    let mut ref_b: Vec<(usize, u32)> = Vec::new();

    let mut lock = lock_cpu(&port).unwrap();

    log::debug!("bytecode len = {}", bytecode.len());

    for cmd in interpret(&bytecode) {
        log::trace!("    {:?}", cmd);
        let is_linked = |id: usize, ref_a: &[(usize, u32)], ref_b: &[(usize, u32)]| {
            ref_a.iter().chain(ref_b).any(|&(i, _)| i == id)
        };

        match cmd {
            Cmd::InsertA(id, target) | Cmd::InsertB(id, target) => {
                if is_linked(id, &ref_a, &ref_b) {
                    continue;
                }
                let (head, kind, model) = if matches!(cmd, Cmd::InsertA(..)) {
                    (&a, ListKind::Current, &mut ref_a)
                } else {
                    (&b, ListKind::Overflow, &mut ref_b)
                };
                let is_new_head = insert(lock.borrow_mut(), head, kind, refs[id], target, 0);
                insert_model(model, id, target);
                assert_eq!(is_new_head, model[0].0 == id);
            }
            Cmd::Unlink(id) => {
                let found_a = unlink(lock.borrow_mut(), &a, refs[id]);
                let found_b = unlink(lock.borrow_mut(), &b, refs[id]);
                let len_before = ref_a.len() + ref_b.len();
                ref_a.retain(|&(i, _)| i != id);
                ref_b.retain(|&(i, _)| i != id);
                let removed = len_before - ref_a.len() - ref_b.len();
                assert_eq!(found_a as usize + found_b as usize, removed);
            }
            Cmd::PopA => {
                let popped = pop_front(lock.borrow_mut(), &a).map(id_of);
                let expected = (!ref_a.is_empty()).then(|| ref_a.remove(0).0);
                assert_eq!(popped, expected);
                if let Some(id) = popped {
                    assert!(refs[id].link(lock.borrow_mut()).list.is_none());
                }
            }
            Cmd::MoveDue(threshold) => {
                let due = take_prefix(lock.borrow_mut(), &a, ListKind::Overflow, |link| {
                    link.target <= threshold
                });
                let rest = b.replace(&mut *lock, None);
                let merged = merge(lock.borrow_mut(), rest, due);
                b.replace(&mut *lock, merged);

                let n = ref_a.iter().take_while(|&&(_, t)| t <= threshold).count();
                let due_model: Vec<_> = ref_a.drain(..n).collect();
                ref_b = merge_model(std::mem::take(&mut ref_b), due_model);
            }
            Cmd::Drain => {
                let chain = b.replace(&mut *lock, None);
                retag(lock.borrow_mut(), chain, ListKind::Current);
                let rest = a.replace(&mut *lock, None);
                let merged = merge(lock.borrow_mut(), chain, rest);
                a.replace(&mut *lock, merged);

                ref_a = merge_model(std::mem::take(&mut ref_b), std::mem::take(&mut ref_a));
            }
        }

        for (head, kind, model) in [(&a, ListKind::Current, &ref_a), (&b, ListKind::Overflow, &ref_b)] {
            assert_eq!(validate(lock.borrow_mut(), head, kind), model.len());

            let mut subject = Vec::new();
            let mut cursor = head.get(&*lock);
            while let Some(entry) = cursor {
                let link = entry.link(lock.borrow_mut());
                subject.push((id_of(entry), link.target));
                cursor = link.next;
            }
            log::trace!("[{kind:?}: {subject:?}]");
            assert_eq!(&subject, model);
        }
    }

    // Unlink everything so that the entries can be dropped
    for &r in &refs {
        unlink(lock.borrow_mut(), &a, r);
        unlink(lock.borrow_mut(), &b, r);
    }
}

#[quickcheck]
fn test_ops(bytecode: Vec<u8>) {
    test_inner(bytecode);
}

#[test]
fn test_ties_keep_insertion_order() {
    test_inner(vec![
        0, 0, 5, // insert 0 @ 5 into a
        0, 1, 5, // insert 1 @ 5 into a
        0, 2, 3, // insert 2 @ 3 into a
        2, 3, 5, // insert 3 @ 5 into b
        6, 0, 5, // move the entries @ ≤ 5 to b
        7, 0, 0, // drain b into a
        5, 0, 0, // pop
    ]);
}

#[test]
fn long_list_orders_by_period_first() {
    let port = Sim32::new(0);
    let entries: Vec<Pin<Box<TimerEntry<Sim32>>>> =
        (0..3).map(|_| Box::pin(TimerEntry::new())).collect();
    // Safety: The entries are pinned
    let refs: Vec<TimerRef<Sim32>> = entries
        .iter()
        .map(|e| unsafe { TimerRef::new(&**e) })
        .collect();

    let head: ListHead<Sim32> = CpuLockCell::new(None);
    let mut lock = lock_cpu(&port).unwrap();

    assert!(insert(lock.borrow_mut(), &head, ListKind::Long, refs[0], 10, 2));
    assert!(insert(lock.borrow_mut(), &head, ListKind::Long, refs[1], 500, 1));
    assert!(!insert(lock.borrow_mut(), &head, ListKind::Long, refs[2], 5, 2));
    assert_eq!(validate(lock.borrow_mut(), &head, ListKind::Long), 3);

    let order: Vec<_> = std::iter::successors(head.get(&*lock), |r| r.next(lock.borrow_mut()))
        .collect();
    assert_eq!(order, [refs[1], refs[2], refs[0]]);

    for &r in &refs {
        assert!(unlink(lock.borrow_mut(), &head, r));
    }
    assert!(head.get(&*lock).is_none());
}

#[test]
#[should_panic(expected = "timer is already linked")]
fn double_insert_panics() {
    let port = Sim32::new(0);
    // Leaked so that the panic doesn't run `TimerEntry::drop` on a linked
    // entry
    let entry: &'static TimerEntry<Sim32> = Box::leak(Box::new(TimerEntry::new()));
    // Safety: `entry` is never moved
    let r = unsafe { TimerRef::new(entry) };

    let head: ListHead<Sim32> = CpuLockCell::new(None);
    let mut lock = lock_cpu(&port).unwrap();
    insert(lock.borrow_mut(), &head, ListKind::Current, r, 1, 0);
    insert(lock.borrow_mut(), &head, ListKind::Current, r, 2, 0);
}
