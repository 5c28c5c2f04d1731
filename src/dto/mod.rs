pub mod dispatch_dto;
pub mod endpoint_dto;
pub mod etl_dto;
pub mod log_dto;
pub mod service_dto;
pub mod task_dto;
