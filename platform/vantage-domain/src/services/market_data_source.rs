use crate::value_objects::bar::Bar;
use std::sync::mpsc::Receiver;

pub trait MarketDataSource {
    fn next_bar(&mut self) -> Option<Bar>;
}

pub struct VecBarSource {
    bars: std::vec::IntoIter<Bar>,
}

impl VecBarSource {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self {
            bars: bars.into_iter(),
        }
    }
}

impl MarketDataSource for VecBarSource {
    fn next_bar(&mut self) -> Option<Bar> {
        self.bars.next()
    }
}

/// Bars pushed by a live feed. The source ends when every sender has been dropped.
pub struct ChannelBarSource {
    rx: Receiver<Bar>,
}

impl ChannelBarSource {
    pub fn new(rx: Receiver<Bar>) -> Self {
        Self { rx }
    }
}

impl MarketDataSource for ChannelBarSource {
    fn next_bar(&mut self) -> Option<Bar> {
        self.rx.recv().ok()
    }
}
