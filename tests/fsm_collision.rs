//! Peer FSM collision resolution and the happy-path to ESTABLISHED
//! (spec.md §8 scenario 4 / §4.5): whichever session the higher
//! router-identifier keeps survives, the other is sent a Notification and
//! closed.
use std::net::Ipv4Addr;

use bgpd::session::fsm::{resolve_collision, CollisionOutcome};
use bgpd::session::{Action, Event, PeerFsm, State};

#[test]
fn higher_local_id_keeps_the_active_session() {
    let local: Ipv4Addr = "1.1.1.1".parse().unwrap();
    let remote: Ipv4Addr = "0.0.0.1".parse().unwrap();
    assert_eq!(resolve_collision(local, remote), CollisionOutcome::KeepActive);
}

#[test]
fn lower_local_id_keeps_the_passive_session() {
    let local: Ipv4Addr = "0.0.0.1".parse().unwrap();
    let remote: Ipv4Addr = "1.1.1.1".parse().unwrap();
    assert_eq!(resolve_collision(local, remote), CollisionOutcome::KeepPassive);
}

#[test]
fn surviving_session_moves_to_openconfirm_then_established() {
    // Active session reaches OpenSent independently.
    let mut active = PeerFsm::new();
    active.step(Event::AdminUp);
    active.step(Event::ConnectTimerExpired);
    active.step(Event::TcpConnected);
    assert_eq!(active.state, State::OpenSent);

    // A passive session also arrives and reaches OpenSent.
    let mut passive = PeerFsm::new();
    passive.step(Event::AdminUp);
    // The passive side is promoted once the open timer fires.
    assert_eq!(passive.step(Event::OpenTimerExpired).next, State::OpenSent);

    // Collision resolution (driven externally by router-id comparison)
    // picked the active session as the winner; the loser is closed.
    let winner_transition = active.step(Event::BgpOpenWinner);
    assert_eq!(winner_transition.next, State::OpenConfirm);
    assert!(winner_transition.actions.contains(&Action::SendKeepalive));

    let loser_transition = passive.step(Event::BgpOpenLoser);
    assert_eq!(loser_transition.next, State::OpenSent);

    // The winner completes the handshake on the surviving session.
    let established = active.step(Event::BgpKeepalive);
    assert_eq!(established.next, State::Established);
}

#[test]
fn duplicate_bgp_identifier_is_fatal() {
    let mut fsm = PeerFsm::new();
    fsm.state = State::OpenSent;
    let t = fsm.step(Event::BgpOpenDuplicateId);
    assert_eq!(t.next, State::Idle);
    assert!(t
        .actions
        .iter()
        .any(|a| matches!(a, Action::SendNotification { major: 2, minor: 3 })));
    assert!(t.actions.contains(&Action::BeginPeerClose));
}
