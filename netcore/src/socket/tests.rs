use std::collections::VecDeque;

use crate::managed::SlotMap;

use super::*;

fn handle() -> SocketHandle {
    let mut keys = SlotMap::new();
    SocketHandle(keys.insert(()))
}

fn transmit(id: u64, data: &[u8]) -> TransmitToken {
    TransmitToken { id: TokenId(id), data: TxData::new(data) }
}

fn in_flight(socket: &mut Socket, id: u64, data: &[u8]) {
    socket.snd_buffer.append(data);
    socket.processing.push_back(InFlight { id: TokenId(id), remaining: data.len(), len: data.len() });
}

#[test]
fn receive_tokens_complete_in_order() {
    let me = handle();
    let mut completions = VecDeque::new();
    let mut socket = Socket::new(0, 4096, 4096);
    socket.rcv_tokens.push_back(ReceiveToken { id: TokenId(1), fragments: vec![3] });
    socket.rcv_tokens.push_back(ReceiveToken { id: TokenId(2), fragments: vec![2, 2] });
    socket.rcv_tokens.push_back(ReceiveToken { id: TokenId(3), fragments: vec![8] });

    socket.append_received(me, b"abcdefg".to_vec(), 0, &mut completions);

    let done: Vec<_> = completions.drain(..).collect();
    assert_eq!(done.len(), 2);
    assert_eq!(done[0].token, TokenId(1));
    assert_eq!(done[0].kind, CompletionKind::Receive(RxData { fragments: vec![b"abc".to_vec()], urgent: false }));
    assert_eq!(done[1].token, TokenId(2));
    assert_eq!(done[1].kind, CompletionKind::Receive(RxData {
        fragments: vec![b"de".to_vec(), b"fg".to_vec()],
        urgent: false,
    }));
    assert_eq!(socket.rcv_tokens.len(), 1);
    assert!(socket.rcv_buffer.is_empty());
}

#[test]
fn urgent_data_is_delivered_separately() {
    let me = handle();
    let mut completions = VecDeque::new();
    let mut socket = Socket::new(0, 4096, 4096);
    socket.append_received(me, b"urg".to_vec(), 3, &mut completions);
    socket.append_received(me, b"normal".to_vec(), 0, &mut completions);

    let token = ReceiveToken { id: TokenId(1), fragments: vec![64] };
    let (_, data) = socket.process_receive_token(token).expect("urgent run");
    assert_eq!(data.concat(), b"urg".to_vec());
    assert!(data.urgent);

    let token = ReceiveToken { id: TokenId(2), fragments: vec![64] };
    let (_, data) = socket.process_receive_token(token).expect("normal run");
    assert_eq!(data.concat(), b"normal".to_vec());
    assert!(!data.urgent);

    let token = ReceiveToken { id: TokenId(3), fragments: vec![64] };
    assert!(socket.process_receive_token(token).is_err());
}

#[test]
fn fin_fails_waiting_receivers_after_data() {
    let me = handle();
    let mut completions = VecDeque::new();
    let mut socket = Socket::new(0, 4096, 4096);
    socket.append_received(me, b"tail".to_vec(), 0, &mut completions);
    socket.rcv_tokens.push_back(ReceiveToken { id: TokenId(1), fragments: vec![2] });
    socket.rcv_tokens.push_back(ReceiveToken { id: TokenId(2), fragments: vec![2] });
    socket.rcv_tokens.push_back(ReceiveToken { id: TokenId(3), fragments: vec![2] });

    // Buffered data is still handed out, the FIN only ends what remains.
    socket.set_no_more_data(me, &mut completions);
    assert!(completions.is_empty());
    socket.satisfy_receive_tokens(me, &mut completions);

    let status: Vec<_> = completions.iter().map(|done| (done.token, done.status)).collect();
    assert_eq!(status, vec![
        (TokenId(1), Ok(())),
        (TokenId(2), Ok(())),
        (TokenId(3), Err(Error::ConnectionFin)),
    ]);
}

#[test]
fn acknowledgements_complete_transmissions() {
    let me = handle();
    let mut completions = VecDeque::new();
    let mut socket = Socket::new(0, 4096, 4096);
    in_flight(&mut socket, 1, b"0123456789");
    in_flight(&mut socket, 2, b"abcde");

    socket.data_acked(me, 4, &mut completions);
    assert!(completions.is_empty());
    assert_eq!(socket.processing.front().map(|head| head.remaining), Some(6));

    socket.data_acked(me, 8, &mut completions);
    let done = completions.pop_front().expect("first transmit");
    assert_eq!((done.token, done.kind), (TokenId(1), CompletionKind::Transmit { len: 10 }));
    assert!(completions.is_empty());
    assert_eq!(socket.processing.front().map(|head| head.remaining), Some(3));
    assert_eq!(socket.unacked_len(), 3);

    socket.data_acked(me, 3, &mut completions);
    let done = completions.pop_front().expect("second transmit");
    assert_eq!((done.token, done.kind), (TokenId(2), CompletionKind::Transmit { len: 5 }));
    assert!(socket.processing.is_empty());
}

#[test]
fn failed_transmission_takes_the_queue_along() {
    let me = handle();
    let mut completions = VecDeque::new();
    let mut socket = Socket::new(0, 4096, 4096);
    socket.snd_tokens.push_back(transmit(2, b"b"));
    socket.snd_tokens.push_back(transmit(3, b"c"));

    socket.fail_transmit_tokens(me, transmit(1, b"a"), Error::AccessDenied, &mut completions);
    let ids: Vec<_> = completions.iter().map(|done| done.token).collect();
    assert_eq!(ids, vec![TokenId(1), TokenId(2), TokenId(3)]);
    assert!(completions.iter().all(|done| done.status == Err(Error::AccessDenied)));
    assert!(socket.snd_tokens.is_empty());
}

#[test]
fn flush_completes_everything_with_the_error() {
    let me = handle();
    let mut completions = VecDeque::new();
    let mut socket = Socket::new(0, 4096, 4096);
    socket.connect_token = Some(TokenId(1));
    socket.listen_tokens.push_back(TokenId(2));
    socket.rcv_tokens.push_back(ReceiveToken { id: TokenId(3), fragments: vec![1] });
    socket.snd_tokens.push_back(transmit(4, b"queued"));
    in_flight(&mut socket, 5, b"sent");
    socket.data_acked(me, 1, &mut completions);
    socket.set_error(Error::ConnectionReset);
    socket.set_error(Error::Timeout);

    socket.flush(me, &mut completions);
    let ids: Vec<_> = completions.iter().map(|done| done.token).collect();
    assert_eq!(ids, vec![TokenId(1), TokenId(2), TokenId(3), TokenId(4), TokenId(5)]);
    assert!(completions.iter().all(|done| done.status == Err(Error::ConnectionReset)));
    // The partially acknowledged token reports what made it.
    assert_eq!(completions.back().map(|done| done.kind.clone()), Some(CompletionKind::Transmit { len: 1 }));
    assert!(socket.snd_buffer.is_empty());
}

#[test]
fn cancel_by_token() {
    let me = handle();
    let mut completions = VecDeque::new();
    let mut socket = Socket::new(0, 4096, 4096);
    socket.close_token = Some(TokenId(1));
    socket.snd_tokens.push_back(transmit(2, b"x"));
    in_flight(&mut socket, 3, b"y");

    assert_eq!(socket.cancel_token(me, TokenId(2), &mut completions), Ok(()));
    assert_eq!(socket.cancel_token(me, TokenId(1), &mut completions), Ok(()));
    assert_eq!(socket.cancel_token(me, TokenId(3), &mut completions), Err(Error::NotFound));
    let ids: Vec<_> = completions.iter().map(|done| (done.token, done.status)).collect();
    assert_eq!(ids, vec![(TokenId(2), Err(Error::Aborted)), (TokenId(1), Err(Error::Aborted))]);

    completions.clear();
    socket.cancel_all(me, &mut completions);
    assert_eq!(completions.len(), 1);
    // Cancelling leaves the data in place.
    assert_eq!(socket.unacked_len(), 1);
}

#[test]
fn back_log_admission() {
    let mut socket = Socket::new(2, 4096, 4096);
    let parent = handle();
    assert!(socket.can_admit_child());
    socket.children.push(parent);
    socket.children.push(parent);
    assert!(!socket.can_admit_child());

    let child = socket.new_child(parent);
    assert_eq!(child.parent, Some(parent));
    assert_eq!(child.state(), ConnectionState::Connecting);
    assert_eq!(child.rcv_buffer.high_water(), 4096);
}
