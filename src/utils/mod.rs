pub use double_buffering_queue::DoubleBufferingQueue;

mod double_buffering_queue;
