pub mod buf;
pub mod cancel;
pub mod work_queue;
