use rpcfleet::pm::wire::{decode_messages, encode_batch, encode_message, Cmd, ControlMessage};

fn sample_message() -> ControlMessage {
    ControlMessage {
        cmd: Cmd::Stop,
        app: "x".to_string(),
        msg_id: "abc".to_string(),
        ..ControlMessage::default()
    }
}

#[test]
fn every_two_way_split_round_trips() {
    // Property: for all splittings of Encode(m) into chunks, feeding them
    // sequentially (eof=false on all but the last) yields exactly [m] and
    // leaves the buffer empty.
    let encoded = encode_message(&sample_message());

    for split in 0..=encoded.len() {
        let mut buffer = Vec::new();
        let mut decoded = Vec::new();

        decoded.extend(decode_messages(&mut buffer, &encoded[..split], false));
        decoded.extend(decode_messages(&mut buffer, &encoded[split..], true));

        assert_eq!(decoded.len(), 1, "split at {} lost the message", split);
        assert_eq!(decoded[0].cmd, Cmd::Stop);
        assert_eq!(decoded[0].app, "x");
        assert_eq!(decoded[0].msg_id, "abc");
        assert!(buffer.is_empty(), "split at {} left residue", split);
    }
}

#[test]
fn every_three_way_split_of_a_batch_round_trips() {
    let batch = encode_batch(&[
        sample_message(),
        ControlMessage {
            cmd: Cmd::Reply,
            msg_id: "abc".to_string(),
            text: "app [x] stopped".to_string(),
            fin: true,
            ..ControlMessage::default()
        },
    ]);

    for first in 0..=batch.len() {
        for second in first..=batch.len() {
            let mut buffer = Vec::new();
            let mut decoded = Vec::new();

            decoded.extend(decode_messages(&mut buffer, &batch[..first], false));
            decoded.extend(decode_messages(&mut buffer, &batch[first..second], false));
            decoded.extend(decode_messages(&mut buffer, &batch[second..], true));

            assert_eq!(
                decoded.len(),
                2,
                "splits at {}/{} lost a message",
                first,
                second
            );
            assert_eq!(decoded[0].cmd, Cmd::Stop);
            assert_eq!(decoded[1].cmd, Cmd::Reply);
            assert!(decoded[1].fin);
            assert!(buffer.is_empty());
        }
    }
}

#[test]
fn one_byte_at_a_time_only_completes_on_the_delimiter() {
    let encoded = encode_message(&sample_message());
    let mut buffer = Vec::new();

    for &byte in &encoded[..encoded.len() - 1] {
        assert!(decode_messages(&mut buffer, &[byte], false).is_empty());
    }

    let decoded = decode_messages(&mut buffer, b"\n", false);
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].msg_id, "abc");
}

#[test]
fn eof_without_trailing_delimiter_still_yields_the_message() {
    let mut encoded = encode_message(&sample_message());
    encoded.pop();

    let mut buffer = Vec::new();
    let decoded = decode_messages(&mut buffer, &encoded, true);

    assert_eq!(decoded.len(), 1);
    assert!(buffer.is_empty());
}

#[test]
fn guests_and_stats_payloads_round_trip() {
    use rpcfleet::pm::wire::{GuestInfo, StatEntry};

    let msg = ControlMessage {
        cmd: Cmd::Reply,
        guests: Some(vec![GuestInfo {
            app: "user-server".to_string(),
            pid: 4242,
            start_time: 1_700_000_000,
        }]),
        stats: Some(vec![StatEntry {
            app: "user-server".to_string(),
            pid: 4242,
            memory: Some(48 * 1024 * 1024),
            cpu: Some(1.25),
        }]),
        fin: true,
        ..ControlMessage::default()
    };

    let mut buffer = Vec::new();
    let decoded = decode_messages(&mut buffer, &encode_message(&msg), false);

    assert_eq!(decoded.len(), 1);
    let guests = decoded[0].guests.as_ref().unwrap();
    assert_eq!(guests[0].app, "user-server");
    assert_eq!(guests[0].start_time, 1_700_000_000);

    let stats = decoded[0].stats.as_ref().unwrap();
    assert_eq!(stats[0].memory, Some(48 * 1024 * 1024));
}
