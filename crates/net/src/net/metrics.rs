use std::ops::{Add, AddAssign};

use super::driver::Delivery;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelMetrics {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
}

impl AddAssign for ChannelMetrics {
    fn add_assign(&mut self, other: Self) {
        self.packets_sent += other.packets_sent;
        self.bytes_sent += other.bytes_sent;
        self.packets_received += other.packets_received;
        self.bytes_received += other.bytes_received;
    }
}

impl Add for ChannelMetrics {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

/// Traffic counters split by delivery class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoMetrics {
    pub reliable: ChannelMetrics,
    pub unreliable: ChannelMetrics,
}

impl IoMetrics {
    pub fn channel(&self, delivery: Delivery) -> &ChannelMetrics {
        match delivery {
            Delivery::Reliable => &self.reliable,
            Delivery::Unreliable => &self.unreliable,
        }
    }

    fn channel_mut(&mut self, delivery: Delivery) -> &mut ChannelMetrics {
        match delivery {
            Delivery::Reliable => &mut self.reliable,
            Delivery::Unreliable => &mut self.unreliable,
        }
    }

    pub fn record_sent(&mut self, delivery: Delivery, bytes: usize) {
        let channel = self.channel_mut(delivery);
        channel.packets_sent += 1;
        channel.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, delivery: Delivery, bytes: usize) {
        let channel = self.channel_mut(delivery);
        channel.packets_received += 1;
        channel.bytes_received += bytes as u64;
    }

    pub fn total(&self) -> ChannelMetrics {
        self.reliable + self.unreliable
    }

    /// Returns the current counters and clears them.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

impl AddAssign for IoMetrics {
    fn add_assign(&mut self, other: Self) {
        self.reliable += other.reliable;
        self.unreliable += other.unreliable;
    }
}

impl Add for IoMetrics {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_commutative() {
        let mut a = IoMetrics::default();
        a.record_sent(Delivery::Reliable, 10);
        a.record_received(Delivery::Unreliable, 4);

        let mut b = IoMetrics::default();
        b.record_sent(Delivery::Reliable, 5);
        b.record_sent(Delivery::Unreliable, 7);

        assert_eq!(a + b, b + a);
        let sum = a + b;
        assert_eq!(sum.reliable.packets_sent, 2);
        assert_eq!(sum.reliable.bytes_sent, 15);
        assert_eq!(sum.total().packets_sent, 3);
        assert_eq!(sum.total().bytes_received, 4);
    }

    #[test]
    fn test_take_clears() {
        let mut metrics = IoMetrics::default();
        metrics.record_received(Delivery::Reliable, 12);

        let taken = metrics.take();
        assert_eq!(taken.reliable.bytes_received, 12);
        assert_eq!(metrics, IoMetrics::default());
    }
}
