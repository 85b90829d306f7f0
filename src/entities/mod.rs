pub mod coupon;
pub mod order;
pub mod order_activity;
pub mod order_item;
pub mod order_note;
pub mod product_variant;
pub mod webhook_event;

pub use coupon::Entity as Coupon;
pub use order::Entity as Order;
pub use order_activity::Entity as OrderActivity;
pub use order_item::Entity as OrderItem;
pub use order_note::Entity as OrderNote;
pub use product_variant::Entity as ProductVariant;
pub use webhook_event::Entity as WebhookEvent;
