//! End-to-end test of the client-visible path: resolve/connect, the
//! REGISTER event a successful acquire sends upstream, and a subsequent
//! dequeue of an event the "engine" side placed in the inbound ring.
//!
//! There's no real `arcan` compositor to connect to, so this test plays
//! the engine side by hand: it stands up the rendezvous listener, a shm
//! segment and semaphore trio under a throwaway key, and pokes the
//! shared page directly the way the real engine-side runtime would.

use std::ffi::CString;
use std::io::Write;
use std::os::unix::net::UnixListener;

use shmif::wire::{cookie, EventQueueFields, SegmentPage, START_SZ};
use shmif::{AcquireFlags, ConnectConfig, Dequeued, EventCategory, SegmentKind, ShmifCont, TargetCommand};

/// Mimics `segment.rs`'s private `sem_name`: the semaphore basename is the
/// shm key with its last character replaced by a `v`/`a`/`e` suffix.
fn sem_name(key: &str, suffix: char) -> String {
    let mut base = key.to_owned();
    let last = base.len() - 1;
    base.replace_range(last.., &suffix.to_string());
    base
}

struct EngineSegment {
    addr: *mut libc::c_void,
    fd: libc::c_int,
    key: String,
    sem_names: [String; 3],
}

impl EngineSegment {
    fn create(key: &str) -> Self {
        let cname = CString::new(key).unwrap();
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
        assert!(fd >= 0, "shm_open failed: {}", std::io::Error::last_os_error());
        assert_eq!(unsafe { libc::ftruncate(fd, START_SZ as libc::off_t) }, 0);

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                START_SZ,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);

        let mut page = SegmentPage::new(std::process::id() as i32);
        assert_eq!(page.cookie, cookie());
        page.segment_size = START_SZ;
        unsafe { std::ptr::write(addr as *mut SegmentPage, page) };

        let sem_names = [sem_name(key, 'v'), sem_name(key, 'a'), sem_name(key, 'e')];
        for name in &sem_names {
            let cname = CString::new(name.as_str()).unwrap();
            let handle = unsafe { libc::sem_open(cname.as_ptr(), libc::O_CREAT, 0o600, 0) };
            assert_ne!(handle, libc::SEM_FAILED, "sem_open({}) failed", name);
            // The handle itself isn't needed again; the client side opens
            // its own via the same name. Close ours immediately.
            unsafe { libc::sem_close(handle) };
        }

        EngineSegment {
            addr,
            fd,
            key: key.to_owned(),
            sem_names,
        }
    }

    fn page(&self) -> &mut SegmentPage {
        unsafe { &mut *(self.addr as *mut SegmentPage) }
    }

    /// Push `ev` onto the child (inbound, from the client's perspective)
    /// ring the way `EventRing::enqueue_nonblocking` would, without going
    /// through the crate's own ring type.
    fn push_child_event(&self, ev: shmif::Event) {
        let q: &mut EventQueueFields = &mut self.page().childevq;
        let next = (q.back + 1) % shmif::wire::QUEUE_SZ as u32;
        assert_ne!(next, q.front, "test ring overflow");
        q.eventbuf[q.back as usize] = ev;
        q.back = next;
    }
}

impl Drop for EngineSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, START_SZ);
            libc::close(self.fd);
            let cname = CString::new(self.key.as_str()).unwrap();
            libc::shm_unlink(cname.as_ptr());
            for name in &self.sem_names {
                let cname = CString::new(name.as_str()).unwrap();
                libc::sem_unlink(cname.as_ptr());
            }
        }
    }
}

#[test]
fn connect_register_and_dequeue_round_trip() {
    let dir = std::env::temp_dir().join(format!("shmif-it-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let sock_path = dir.join("rendezvous.sock");
    let _ = std::fs::remove_file(&sock_path);

    let key = format!("/svt{}", std::process::id() % 1_000_000);
    let engine = EngineSegment::create(&key);

    let listener = UnixListener::bind(&sock_path).unwrap();
    let key_for_server = key.clone();
    let server = std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        conn.write_all(format!("{}\n", key_for_server).as_bytes()).unwrap();
    });

    let config = ConnectConfig {
        connpath: Some(sock_path.to_str().unwrap().to_owned()),
        connkey: None,
        flags: AcquireFlags::DISABLE_GUARD,
        segment_kind: Some(SegmentKind::Application),
        fatal_hook: None,
    };
    let mut cont = ShmifCont::connect(config).expect("connect+acquire should succeed");
    server.join().unwrap();

    assert!(cont.is_alive());
    assert!(!cont.is_output());

    // The acquire path enqueues a REGISTER-shaped event advertising the
    // segment kind; the engine side observes it on `parentevq`.
    let parentevq = &engine.page().parentevq;
    assert_ne!(parentevq.front, parentevq.back, "expected a REGISTER event upstream");
    let register = parentevq.eventbuf[parentevq.front as usize];
    assert_eq!(register.category, EventCategory::External as u8);
    let reg_target = register.as_target().expect("REGISTER carries a target payload");
    assert_eq!(reg_target.kind, TargetCommand::Other);
    assert_eq!(reg_target.ioevs[0].as_int(), SegmentKind::Application as i32);

    // The engine now hands the client a DISPLAYHINT.
    let mut hint = shmif::Event::target(TargetCommand::Displayhint);
    if let Some(t) = hint.as_target_mut() {
        t.ioevs[0] = shmif::wire::IoVal::Int(1280);
        t.ioevs[1] = shmif::wire::IoVal::Int(720);
    }
    engine.push_child_event(hint);

    match cont.poll() {
        Dequeued::Delivered(ev) => {
            let t = ev.as_target().expect("displayhint is a target event");
            assert_eq!(t.kind, TargetCommand::Displayhint);
            assert_eq!(t.ioevs[0].as_int(), 1280);
            assert_eq!(t.ioevs[1].as_int(), 720);
        }
        other => panic!("expected the DISPLAYHINT, got {:?}", other),
    }
    assert_eq!(cont.poll(), Dequeued::None);

    drop(cont);
    let _ = std::fs::remove_dir_all(&dir);
}
