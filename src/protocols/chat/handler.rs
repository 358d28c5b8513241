//! Chat task: line framing plus command handling.

use bytes::{Buf, BytesMut};

use super::parser::{self, Command, ParseError, ParseResult};
use crate::runtime::{ConnectionInterface, Feed, Task};

/// Default longest accepted line, terminator excluded.
pub const DEFAULT_MAX_LINE: usize = 1024;

/// Per-connection chat state.
pub struct ChatTask {
    buffer: BytesMut,
    max_line: usize,
}

impl ChatTask {
    pub fn new(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_line),
            max_line,
        }
    }
}

impl Default for ChatTask {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

impl Task for ChatTask {
    type Unit = Result<Command, ParseError>;

    fn feed(&mut self, bytes: &[u8]) -> Feed<Self::Unit> {
        self.buffer.extend_from_slice(bytes);
        match parser::parse(&self.buffer, self.max_line) {
            ParseResult::Complete(command, consumed) => {
                self.buffer.advance(consumed);
                Feed::Complete(Ok(command))
            }
            ParseResult::Rejected(e, consumed) => {
                self.buffer.advance(consumed);
                Feed::Complete(Err(e))
            }
            ParseResult::Incomplete => Feed::NeedMoreData,
            ParseResult::Overflow => {
                Feed::Malformed(format!("line exceeds {} bytes", self.max_line))
            }
        }
    }

    fn handle(&mut self, unit: Self::Unit, conn: &dyn ConnectionInterface) {
        let command = match unit {
            Ok(command) => command,
            Err(e) => return conn.response(&parser::error(&e.to_string())),
        };

        match command {
            Command::Nick(id) => {
                conn.set_id(&id);
                if conn.id().as_deref() == Some(id.as_str()) {
                    conn.response(b"OK\r\n");
                } else {
                    conn.response(&parser::error("id taken"));
                }
            }
            Command::Msg { to, text } => match conn.id() {
                Some(sender) => conn.unicast(&to, &parser::delivery(&sender, &text)),
                None => conn.response(&parser::error("pick an id with NICK first")),
            },
            Command::All(text) => match conn.id() {
                Some(sender) => conn.broadcast(&parser::delivery(&sender, &text)),
                None => conn.response(&parser::error("pick an id with NICK first")),
            },
            Command::Ping(message) => conn.response(&parser::pong(message.as_deref())),
            Command::Quit => {
                conn.response(b"OK\r\n");
                conn.stop();
            }
        }
    }

    fn on_connect(&mut self, conn: &dyn ConnectionInterface) {
        conn.log(b"chat session started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::StubConn;
    use bytes::Bytes;

    fn drain(task: &mut ChatTask, bytes: &[u8], conn: &StubConn) -> usize {
        let mut handled = 0;
        let mut outcome = task.feed(bytes);
        while let Feed::Complete(unit) = outcome {
            task.handle(unit, conn);
            handled += 1;
            outcome = task.feed(&[]);
        }
        handled
    }

    #[test]
    fn test_partial_lines_are_buffered() {
        let mut task = ChatTask::default();
        let conn = StubConn::new();

        assert_eq!(drain(&mut task, b"PI", &conn), 0);
        assert_eq!(drain(&mut task, b"NG\r\nPING a\r", &conn), 1);
        assert_eq!(drain(&mut task, b"\n", &conn), 1);

        assert_eq!(
            conn.received(),
            vec![b"PONG\r\n".to_vec(), b"PONG a\r\n".to_vec()]
        );
    }

    #[test]
    fn test_nick_then_msg() {
        let mut task = ChatTask::default();
        let conn = StubConn::new();

        drain(&mut task, b"MSG bob hi\r\nNICK alice\r\nMSG bob hi\r\n", &conn);

        assert_eq!(
            conn.received(),
            vec![
                b"ERR pick an id with NICK first\r\n".to_vec(),
                b"OK\r\n".to_vec()
            ]
        );
        assert_eq!(
            conn.unicasts(),
            vec![("bob".to_string(), b"FROM alice hi\r\n".to_vec())]
        );
    }

    #[test]
    fn test_all_broadcasts() {
        let mut task = ChatTask::default();
        let conn = StubConn::new();

        drain(&mut task, b"NICK alice\nALL hello\n", &conn);
        assert_eq!(conn.broadcasts(), vec![b"FROM alice hello\r\n".to_vec()]);
    }

    #[test]
    fn test_rejected_line_keeps_connection() {
        let mut task = ChatTask::default();
        let conn = StubConn::new();

        drain(&mut task, b"BOGUS\r\nPING\r\n", &conn);
        assert_eq!(
            conn.received(),
            vec![
                b"ERR unknown command 'BOGUS'\r\n".to_vec(),
                b"PONG\r\n".to_vec()
            ]
        );
        assert!(!conn.stopped());
    }

    #[test]
    fn test_quit_stops() {
        let mut task = ChatTask::default();
        let conn = StubConn::new();

        drain(&mut task, b"QUIT\r\n", &conn);
        assert_eq!(conn.received(), vec![b"OK\r\n".to_vec()]);
        assert!(conn.stopped());
    }

    #[test]
    fn test_overlong_line_is_malformed() {
        let mut task = ChatTask::new(8);
        assert!(matches!(task.feed(b"ALL 0123456789"), Feed::Malformed(_)));
    }

    #[test]
    fn test_line_at_limit_is_accepted() {
        let pong = || Feed::Complete(Ok(Command::Ping(Some(Bytes::from_static(b"123")))));

        let mut task = ChatTask::new(8);
        assert_eq!(task.feed(b"PING 123\n"), pong());
        assert_eq!(task.feed(b"PING 123\r\n"), pong());

        // CR and LF arriving in separate reads
        assert_eq!(task.feed(b"PING 123\r"), Feed::NeedMoreData);
        assert_eq!(task.feed(b"\n"), pong());
        assert_eq!(task.feed(&[]), Feed::NeedMoreData);
    }

    #[test]
    fn test_on_connect_logs() {
        let mut task = ChatTask::default();
        let conn = StubConn::new();
        task.on_connect(conn.as_ref());
        assert_eq!(conn.logs(), vec!["chat session started".to_string()]);
    }
}
