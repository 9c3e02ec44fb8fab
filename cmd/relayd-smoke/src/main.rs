//! relayd worker runtime smoke test
//!
//! Exercises the full runtime end to end:
//!   Part A — pool lifecycle: init, start, per-worker round trip
//!   Part B — task dispatch: broadcast, disposable, serial, concurrent
//!   Part C — shared accept: a listening socket served by every worker
//!   Part D — load and statistics reporting, then shutdown
//!
//! Run: ./target/release/relayd-smoke [workers] [connections]

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use relayd_core::Semaphore;
use relayd_runtime::load::Granularity;
use relayd_runtime::{poll, pool, ExecuteMode, PollData, PollEvents, RuntimeConfig, Task, Worker};

const LINE: &str = "────────────────────────────────────────────────────────────";

fn section(name: &str) {
    eprintln!("\n{}\n{}\n{}", LINE, name, LINE);
}

struct StoreWorkerId(Arc<AtomicI64>);

impl Task for StoreWorkerId {
    fn execute(&self, worker: &Worker) {
        self.0.store(worker.id() as i64, Ordering::SeqCst);
    }
}

struct Bump(Arc<AtomicUsize>);

impl Task for Bump {
    fn execute(&self, _worker: &Worker) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// No-op task used as a pool-wide barrier.
struct Barrier;

impl Task for Barrier {
    fn execute(&self, _worker: &Worker) {}
}

struct PrintWorker;

impl Task for PrintWorker {
    fn execute(&self, worker: &Worker) {
        let (current, total) = worker.handle().descriptor_counts();
        eprintln!(
            "  worker {}: state {:?}, descriptors {}/{}",
            worker.id(),
            worker.handle().state(),
            current,
            total
        );
    }
}

#[repr(C)]
struct Acceptor {
    data: PollData,
    fd: RawFd,
    accepted: AtomicUsize,
}

unsafe fn accept_handler(data: *mut PollData, _wid: i32, events: PollEvents) -> PollEvents {
    let acceptor = &*(data as *const Acceptor);
    let conn = libc::accept(acceptor.fd, std::ptr::null_mut(), std::ptr::null_mut());
    if conn >= 0 {
        libc::close(conn);
        acceptor.accepted.fetch_add(1, Ordering::SeqCst);
        events & PollEvents::ACCEPT
    } else {
        PollEvents::empty()
    }
}

fn listening_socket() -> (RawFd, u16) {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        assert!(fd >= 0, "socket() failed");
        poll::set_nonblocking(fd).expect("set_nonblocking failed");
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();
        assert_eq!(
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ),
            0,
            "bind() failed"
        );
        assert_eq!(libc::listen(fd, 128), 0, "listen() failed");

        let mut bound: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        assert_eq!(
            libc::getsockname(
                fd,
                &mut bound as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            ),
            0
        );
        (fd, u16::from_be(bound.sin_port))
    }
}

fn main() {
    relayd_core::rlog::init();

    let workers: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);
    let connections: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);

    section("Part A — pool lifecycle");
    let config = RuntimeConfig::from_env()
        .thread_count(workers)
        .maxwait(100);
    pool::init(&config).expect("pool init failed");
    pool::start_all().expect("pool start failed");
    eprintln!("  {} workers started", pool::thread_count());

    let ran_on = Arc::new(AtomicI64::new(-1));
    let sem = Arc::new(Semaphore::new());
    let target = pool::get(1).expect("worker 1 missing");
    target
        .post(
            Arc::new(StoreWorkerId(Arc::clone(&ran_on))),
            Some(Arc::clone(&sem)),
            ExecuteMode::Immediate,
        )
        .expect("post failed");
    sem.wait();
    eprintln!("  round trip: task ran on worker {}", ran_on.load(Ordering::SeqCst));

    section("Part B — task dispatch");
    let hits = Arc::new(AtomicUsize::new(0));
    let n = pool::execute_concurrently(Arc::new(Bump(Arc::clone(&hits))));
    eprintln!("  concurrent: {} workers, {} executions", n, hits.load(Ordering::SeqCst));

    let hits = Arc::new(AtomicUsize::new(0));
    let n = pool::broadcast_disposable(Arc::new(Bump(Arc::clone(&hits))));
    eprintln!("  disposable broadcast posted to {} workers", n);

    eprintln!("  serial diagnostic pass:");
    pool::execute_serially(Arc::new(PrintWorker));

    section("Part C — shared accept");
    let (lfd, port) = listening_socket();
    let acceptor = Box::new(Acceptor {
        data: PollData::new(accept_handler),
        fd: lfd,
        accepted: AtomicUsize::new(0),
    });
    let acceptor_ptr = Box::into_raw(acceptor);
    unsafe {
        pool::add_shared_fd(lfd, PollEvents::ACCEPT, acceptor_ptr as *mut PollData)
            .expect("shared add failed");
    }
    let acceptor = unsafe { &*acceptor_ptr };

    let start = Instant::now();
    let mut clients = Vec::with_capacity(connections);
    for _ in 0..connections {
        clients.push(std::net::TcpStream::connect(("127.0.0.1", port)).expect("connect failed"));
    }
    while acceptor.accepted.load(Ordering::SeqCst) < connections {
        if start.elapsed() > Duration::from_secs(10) {
            eprintln!(
                "  TIMEOUT: accepted only {}/{}",
                acceptor.accepted.load(Ordering::SeqCst),
                connections
            );
            std::process::exit(1);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    eprintln!(
        "  {} connections accepted across the pool in {:?}",
        connections,
        start.elapsed()
    );
    drop(clients);
    pool::remove_shared_fd(lfd).expect("shared remove failed");
    // Residuals for the listener may still be queued on some worker; the
    // barrier waits out the removal flush before the acceptor goes away.
    pool::execute_concurrently(Arc::new(Barrier));
    unsafe {
        libc::close(lfd);
        drop(Box::from_raw(acceptor_ptr));
    }

    section("Part D — load, statistics, shutdown");
    for id in 1..=pool::thread_count() as i32 {
        let handle = pool::get(id).unwrap();
        eprintln!(
            "  worker {}: load {}%/{}%/{}% (1s/1m/1h)",
            id,
            handle.load(Granularity::OneSecond),
            handle.load(Granularity::OneMinute),
            handle.load(Granularity::OneHour),
        );
    }
    let sum = pool::statistics();
    eprintln!(
        "  aggregate: polls {}, events {}, reads {}, accepts {}, max exec {} ms",
        sum.n_polls, sum.n_pollev, sum.n_read, sum.n_accept, sum.maxexectime
    );

    pool::shutdown_all();
    pool::join_all();
    pool::finish();
    eprintln!("\nOK — all workers stopped cleanly");
}
