//! User memory and per-process resources across fork, growth and exit.

mod common;

use mpkernel::config::USER_END;
use mpkernel::hosted::MachineConfig;
use mpkernel::memory::address::PAGE_SIZE;

use common::{Log, TIMEOUT};

#[test]
fn forked_memory_is_a_private_copy() {
    #[derive(Default, Clone)]
    struct Views {
        child: Vec<u8>,
        parent: Vec<u8>,
    }
    let log: Log<Views> = Log::new();
    let seen = log.clone();
    let machine = common::boot(MachineConfig::default(), move |user| {
        user.store(0x100, b"parent");
        let child_log = seen.clone();
        user.fork(move |user| {
            let mut buf = [0u8; 6];
            user.load(0x100, &mut buf);
            child_log.get().child.extend_from_slice(&buf);
            user.store(0x100, b"child!");
            user.exit(0)
        });
        user.wait();
        let mut buf = [0u8; 6];
        user.load(0x100, &mut buf);
        seen.get().parent.extend_from_slice(&buf);
        user.reap_forever()
    });

    assert!(machine.wait_for(TIMEOUT, |_| !log.get().parent.is_empty()));
    let views = log.snapshot();
    assert_eq!(views.child, b"parent".to_vec());
    assert_eq!(views.parent, b"parent".to_vec());
}

#[test]
fn growth_past_the_user_limit_is_refused() {
    let sizes: Log<Vec<Option<u64>>> = Log::new();
    let seen = sizes.clone();
    let machine = common::boot(MachineConfig::default(), move |user| {
        let results = [
            user.sbrk(0),
            user.sbrk(USER_END as i64),
            user.sbrk(0),
            user.sbrk(-2 * PAGE_SIZE as i64),
            user.sbrk(0),
        ];
        seen.get().extend(results);
        user.reap_forever()
    });

    assert!(machine.wait_for(TIMEOUT, |_| sizes.get().len() == 5));
    let one_page = Some(PAGE_SIZE);
    assert_eq!(
        sizes.snapshot(),
        vec![one_page, None, one_page, None, one_page]
    );
}

#[test]
fn grow_then_shrink_returns_every_frame() {
    #[derive(Default, Clone)]
    struct Seen {
        free: Vec<usize>,
        old_sizes: Vec<Option<u64>>,
        echoed: Vec<u8>,
        child: Option<i32>,
    }
    let grow = 3 * PAGE_SIZE + 100;
    let log: Log<Seen> = Log::new();
    let seen = log.clone();
    let mut machine = common::machine(MachineConfig::default());
    let frames = machine.frames();
    machine
        .start(move |user| {
            let before = frames.free_count();
            let old = user.sbrk(grow as i64);
            let grown = frames.free_count();
            user.store(4 * PAGE_SIZE + 50, b"top");
            let mut buf = [0u8; 3];
            user.load(4 * PAGE_SIZE + 50, &mut buf);
            let shrunk_from = user.sbrk(-(grow as i64));
            let after = frames.free_count();

            // The vacated range is gone for good.
            user.fork(|user| {
                let mut buf = [0u8; 1];
                user.load(2 * PAGE_SIZE, &mut buf);
                user.exit(0)
            });
            let child = user.wait().map(|(_, status)| status);

            let mut s = seen.get();
            s.free.extend([before, grown, after]);
            s.old_sizes.extend([old, shrunk_from]);
            s.echoed.extend_from_slice(&buf);
            s.child = child;
            drop(s);
            user.reap_forever()
        })
        .unwrap();

    assert!(machine.wait_for(TIMEOUT, |_| log.get().child.is_some()));
    let seen = log.snapshot();
    let [before, grown, after] = seen.free[..] else {
        panic!("missing free counts: {:?}", seen.free);
    };
    assert_eq!(before - grown, 4);
    assert_eq!(after, before);
    assert_eq!(seen.old_sizes, vec![Some(PAGE_SIZE), Some(PAGE_SIZE + grow)]);
    assert_eq!(seen.echoed, b"top".to_vec());
    assert_eq!(seen.child, Some(-1));
}

#[test]
fn exit_and_wait_return_every_frame() {
    let counts: Log<Vec<usize>> = Log::new();
    let seen = counts.clone();
    let mut machine = common::machine(MachineConfig::default());
    let frames = machine.frames();
    machine
        .start(move |user| {
            let before = frames.free_count();
            for _ in 0..10 {
                user.fork(|user| {
                    user.sbrk(5 * PAGE_SIZE as i64);
                    user.store(3 * PAGE_SIZE, b"scribble");
                    user.fork(|user| user.exit(0));
                    user.wait();
                    user.exit(0)
                });
                user.wait();
            }
            seen.get().extend([before, frames.free_count()]);
            user.reap_forever()
        })
        .unwrap();

    assert!(machine.wait_for(TIMEOUT, |_| counts.get().len() == 2));
    let counts = counts.snapshot();
    assert_eq!(counts[0], counts[1]);
}

#[test]
fn failed_fork_leaves_the_parent_untouched() {
    #[derive(Default, Clone)]
    struct Seen {
        forked: Option<bool>,
        free: Vec<usize>,
        sizes: Vec<u64>,
        echoed: Vec<u8>,
    }
    let log: Log<Seen> = Log::new();
    let seen = log.clone();
    let config = MachineConfig {
        frames: 128,
        ..MachineConfig::default()
    };
    let mut machine = common::machine(config);
    let frames = machine.frames();
    machine
        .start(move |user| {
            // Eat memory until the allocator runs dry, then give a little
            // back: enough for a kernel stack, not for a copy of us.
            while user.sbrk(PAGE_SIZE as i64).is_some() {}
            user.sbrk(-4 * PAGE_SIZE as i64);
            let size = user.sbrk(0).unwrap_or(0);
            user.store(size - 8, b"survivor");

            let before = frames.free_count();
            let child = user.fork(|user| user.exit(0));
            let after = frames.free_count();

            let mut buf = [0u8; 8];
            user.load(size - 8, &mut buf);
            let size_after = user.sbrk(0).unwrap_or(0);

            let mut s = seen.get();
            s.forked = Some(child.is_some());
            s.free.extend([before, after]);
            s.sizes.extend([size, size_after]);
            s.echoed.extend_from_slice(&buf);
            drop(s);
            user.reap_forever()
        })
        .unwrap();

    assert!(machine.wait_for(TIMEOUT, |_| log.get().forked.is_some()));
    let seen = log.snapshot();
    assert_eq!(seen.forked, Some(false));
    assert_eq!(seen.free[0], seen.free[1]);
    assert_eq!(seen.sizes[0], seen.sizes[1]);
    assert_eq!(seen.echoed, b"survivor".to_vec());
}

#[test]
fn files_and_directory_references_follow_fork_and_exit() {
    #[derive(Default, Clone)]
    struct Refs {
        in_child: Option<(u32, u32)>,
        after_reap: Option<(u32, u32)>,
        fd: Option<usize>,
    }
    let log: Log<Refs> = Log::new();
    let seen = log.clone();
    let mut machine = common::machine(MachineConfig::default());
    let fs = machine.fs();
    let file = fs.create(b"shared log");
    machine
        .start(move |user| {
            let fd = user.attach(file);
            seen.get().fd = fd;
            let child_log = seen.clone();
            user.fork(move |user| {
                child_log.get().in_child = Some((fs.file_refs(file), fs.dir_refs()));
                user.exit(0)
            });
            user.wait();
            seen.get().after_reap = Some((fs.file_refs(file), fs.dir_refs()));
            user.reap_forever()
        })
        .unwrap();

    assert!(machine.wait_for(TIMEOUT, |_| log.get().after_reap.is_some()));
    let refs = log.snapshot();
    assert_eq!(refs.fd, Some(0));
    assert_eq!(refs.in_child, Some((2, 2)));
    assert_eq!(refs.after_reap, Some((1, 1)));
}
