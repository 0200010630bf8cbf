//! Process-level coverage for the fork fan-out contract (S4 in the design
//! doc): a child inherits the parent's descriptors without the bridge's
//! knowledge, so `bridge::add_user` has to re-count every connection before
//! the child does any I/O, or its independent disconnect would undercut the
//! parent's refcount.

use tssx_core::bridge;
use tssx_core::config::ConnectionOptions;
use tssx_core::connection::Connection;
use tssx_core::session::Session;

#[test]
fn child_fan_out_keeps_segment_alive_until_every_holder_disconnects() {
    let options = ConnectionOptions::default();
    let server = Connection::create(&options).expect("create");
    let segment_id = server.segment_id();
    // A second, independent attachment stands in for the peer process that
    // is never forked; it just needs to keep the segment alive for the
    // duration of the test and disconnect at the end.
    let peer = Connection::setup(segment_id, &options).expect("peer setup");

    let fd = 8_192;
    bridge::insert(fd, Session::Connected(server)).expect("insert");

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");

    if pid == 0 {
        // Child: fan out open_count, then disconnect its own copy.
        let exit_code = match bridge::add_user().and_then(|_| bridge::erase(fd)) {
            Ok(Some(Session::Connected(connection))) => match connection.disconnect() {
                Ok(()) => 0,
                Err(_) => 1,
            },
            _ => 1,
        };
        unsafe { libc::_exit(exit_code) };
    }

    let mut status: libc::c_int = 0;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 0, "child failed to fan out and disconnect");

    // Parent still holds its own entry for fd; disconnect it too.
    match bridge::erase(fd).expect("erase") {
        Some(Session::Connected(connection)) => connection.disconnect().expect("parent disconnect"),
        other => panic!("expected a connected session, got {}", other.is_some()),
    }

    peer.disconnect().expect("peer disconnect");
}
