diesel::table! {
    stock_records (product_id) {
        product_id -> Int4,
        stock -> Int4,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    processed_orders (order_id) {
        order_id -> Int4,
        product_id -> Int4,
        quantity -> Int4,
        outcome -> Varchar,
        processed_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(stock_records, processed_orders);
