pub mod async_task;

pub mod command;

pub mod file_io;
