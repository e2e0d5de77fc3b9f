diesel::table! {
    orders (id) {
        id -> Int4,
        product_id -> Int4,
        quantity -> Int4,
        total_price -> Numeric,
        status -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    order_outbox (id) {
        id -> Uuid,
        aggregate_id -> Int4,
        event_type -> Varchar,
        payload -> Jsonb,
        published -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(orders, order_outbox);
