pub use crate::adc::AdcInstance as _stm32_compose_adc_AdcInstance;
pub use crate::can::CanInstance as _stm32_compose_can_CanInstance;
pub use crate::dma::DmaChannel as _stm32_compose_dma_DmaChannel;
#[cfg(feature = "device-selected")]
pub use crate::dma::DmaExt as _stm32_compose_dma_DmaExt;
pub use crate::event::Subscriber as _stm32_compose_event_Subscriber;
pub use crate::feature::Feature as _stm32_compose_feature_Feature;
pub use crate::feature::Peripheral as _stm32_compose_feature_Peripheral;
pub use fugit::ExtU32 as _fugit_ExtU32;
pub use fugit::RateExtU32 as _fugit_RateExtU32;
