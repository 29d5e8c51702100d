//! Outbound statement queues
//!
//! Statements wait in one of two FIFO lanes: the control lane (listen and
//! unlisten) and the data lane (notify). Exactly one statement is in flight
//! at a time, and the control lane is always serviced first. Sustained
//! subscription churn can therefore starve the data lane; the connection's
//! listen set is kept current ahead of broadcasts.
//!
//! A statement stays at the head of its lane until its completion is
//! reported, so a statement in flight when the connection fails is issued
//! again on the next connection.

use std::collections::VecDeque;

/// Statement issued on every new connection before any resubscription.
pub(crate) const UNLISTEN_ALL: &str = "unlisten *";

/// Lane a statement was queued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    /// Listen / unlisten
    Control,
    /// Notify
    Data,
}

/// Build a listen statement. Channel names are quoted to keep their case.
pub(crate) fn listen(channel: &str) -> String {
    format!("listen \"{channel}\"")
}

/// Build an unlisten statement.
pub(crate) fn unlisten(channel: &str) -> String {
    format!("unlisten \"{channel}\"")
}

/// Build a notify statement carrying `payload` in a dollar-quoted literal.
///
/// The payload must not contain `$`; the codec guarantees this.
pub(crate) fn notify(channel: &str, payload: &str) -> String {
    format!("notify \"{channel}\",$${payload}$$;")
}

/// The two statement lanes and the in-flight marker.
#[derive(Debug, Default)]
pub(crate) struct Outbound {
    control: VecDeque<String>,
    data: VecDeque<String>,
    in_flight: Option<Lane>,
}

impl Outbound {
    pub(crate) fn push_control(&mut self, statement: String) {
        self.control.push_back(statement);
    }

    pub(crate) fn push_data(&mut self, statement: String) {
        self.data.push_back(statement);
    }

    /// Replace the control lane with a full resubscription for `topics`.
    pub(crate) fn resync<'a>(&mut self, topics: impl IntoIterator<Item = &'a str>) {
        self.control.clear();
        self.control.push_back(UNLISTEN_ALL.to_string());
        self.control.extend(topics.into_iter().map(listen));
    }

    /// Take the next statement to execute and mark it in flight.
    ///
    /// Returns `None` if a statement is already in flight or both lanes are empty.
    pub(crate) fn next(&mut self) -> Option<String> {
        if self.in_flight.is_some() {
            return None;
        }

        let (lane, statement) = if let Some(statement) = self.control.front() {
            (Lane::Control, statement)
        } else if let Some(statement) = self.data.front() {
            (Lane::Data, statement)
        } else {
            return None;
        };

        let statement = statement.clone();
        self.in_flight = Some(lane);
        Some(statement)
    }

    /// Retire the statement in flight, returning the lane it came from.
    pub(crate) fn complete(&mut self) -> Option<Lane> {
        let lane = self.in_flight.take()?;
        match lane {
            Lane::Control => self.control.pop_front(),
            Lane::Data => self.data.pop_front(),
        };
        Some(lane)
    }

    /// Forget the statement in flight without retiring it.
    pub(crate) fn abandon(&mut self) {
        self.in_flight = None;
    }

    pub(crate) fn in_flight(&self) -> Option<Lane> {
        self.in_flight
    }

    pub(crate) fn control(&self) -> impl Iterator<Item = &str> {
        self.control.iter().map(String::as_str)
    }

    pub(crate) fn data_len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn clear(&mut self) {
        self.control.clear();
        self.data.clear();
        self.in_flight = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_text() {
        assert_eq!(listen("orders"), "listen \"orders\"");
        assert_eq!(unlisten("Orders"), "unlisten \"Orders\"");
        assert_eq!(notify("orders", "e1:null"), "notify \"orders\",$$e1:null$$;");
    }

    #[test]
    fn test_control_before_data() {
        let mut outbound = Outbound::default();
        outbound.push_data(notify("a", "e"));
        outbound.push_control(listen("a"));

        assert_eq!(outbound.next().as_deref(), Some("listen \"a\""));
        assert_eq!(outbound.next(), None, "only one statement in flight");
        assert_eq!(outbound.complete(), Some(Lane::Control));

        outbound.push_control(listen("b"));
        assert_eq!(outbound.next().as_deref(), Some("listen \"b\""));
        assert_eq!(outbound.complete(), Some(Lane::Control));

        assert_eq!(outbound.next().as_deref(), Some("notify \"a\",$$e$$;"));
        assert_eq!(outbound.in_flight(), Some(Lane::Data));
        assert_eq!(outbound.complete(), Some(Lane::Data));

        assert_eq!(outbound.next(), None);
        assert_eq!(outbound.complete(), None);
    }

    #[test]
    fn test_abandoned_statement_is_retried() {
        let mut outbound = Outbound::default();
        outbound.push_data(notify("a", "e1:null"));
        outbound.push_data(notify("a", "e2:null"));

        assert_eq!(outbound.next().as_deref(), Some("notify \"a\",$$e1:null$$;"));
        outbound.abandon();

        assert_eq!(outbound.next().as_deref(), Some("notify \"a\",$$e1:null$$;"));
        assert_eq!(outbound.data_len(), 2);
    }

    #[test]
    fn test_resync_replaces_control_lane() {
        let mut outbound = Outbound::default();
        outbound.push_control(listen("stale"));
        outbound.push_control(unlisten("stale"));
        outbound.push_data(notify("kept", "e"));

        outbound.resync(["alpha", "beta"]);

        let control: Vec<&str> = outbound.control().collect();
        assert_eq!(control, vec!["unlisten *", "listen \"alpha\"", "listen \"beta\""]);
        assert_eq!(outbound.data_len(), 1);
    }
}
