//! Filesystem-backed queue tests: what the in-memory unit tests cover, but
//! through real files, reopens and rotations.

use partlog_diskqueue::{
    store::{FileSlot, Fs},
    FramedQueue, Location, Options,
};

fn opts() -> Options {
    Options { max_file_bytes: 256 }
}

#[test]
fn fs_roundtrip_with_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Fs::new(tmp.path()).unwrap();

    let mut locations = Vec::new();
    {
        let mut queue = FramedQueue::open(store.clone(), opts(), Location::ZERO).unwrap();
        for i in 0u8..10 {
            let (start, _) = queue.push(&[i; 33]).unwrap();
            locations.push(start);
        }
        queue.commit().unwrap();
    }

    let mut queue = FramedQueue::open(store, opts(), Location::ZERO).unwrap();
    for i in 0u8..10 {
        let frame = queue.read_next().expect("record should have been durable");
        assert_eq!(frame.payload, vec![i; 33]);
        assert_eq!(frame.start, locations[i as usize]);
    }
    assert!(queue.read_next().is_none());
}

#[test]
fn fs_crash_truncation_drops_uncommitted_tail() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Fs::new(tmp.path()).unwrap();

    let keep_end;
    {
        let mut queue = FramedQueue::open(store.clone(), opts(), Location::ZERO).unwrap();
        queue.push(b"v10").unwrap();
        let (_, end) = queue.push(b"v20").unwrap();
        keep_end = end;
        queue.push(b"v30").unwrap();
        queue.commit().unwrap();
    }

    // Simulate a crash that lost the trailing byte of the last frame.
    let path = store.file_path(FileSlot::Zero);
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 1).unwrap();

    let mut queue = FramedQueue::open(store.clone(), opts(), Location::ZERO).unwrap();
    assert_eq!(queue.read_next().unwrap().payload, b"v10");
    assert_eq!(queue.read_next().unwrap().payload, b"v20");
    assert!(queue.read_next().is_none());
    assert_eq!(queue.push_location(), keep_end);

    queue.push(b"v40").unwrap();
    queue.commit().unwrap();
    drop(queue);

    let mut queue = FramedQueue::open(store, opts(), Location::ZERO).unwrap();
    let replayed: Vec<_> = std::iter::from_fn(|| queue.read_next())
        .map(|f| f.payload)
        .collect();
    assert_eq!(replayed, vec![b"v10".to_vec(), b"v20".to_vec(), b"v40".to_vec()]);
}

#[test]
fn fs_pop_allows_file_recycling() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Fs::new(tmp.path()).unwrap();
    let mut queue = FramedQueue::open(store.clone(), opts(), Location::ZERO).unwrap();

    // Fill well past one file's capacity, popping as we go so rotation can
    // always reclaim.
    let mut last_end = Location::ZERO;
    for i in 0..64u8 {
        let (_, end) = queue.push(&[i; 64]).unwrap();
        queue.commit().unwrap();
        queue.pop(last_end);
        last_end = end;
    }

    // Neither file should have grown unboundedly.
    for slot in FileSlot::ALL {
        let len = std::fs::metadata(store.file_path(slot)).unwrap().len();
        assert!(
            len < 4 * opts().max_file_bytes,
            "file {slot} grew to {len} bytes"
        );
    }

    // The unpopped suffix is still readable after reopen.
    drop(queue);
    let mut queue = FramedQueue::open(store, opts(), last_end).unwrap();
    assert!(queue.read_next().is_none());
}
