pub mod letterbox;
